//! Following `3xx` responses.

use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, PROXY_AUTHORIZATION, SET_COOKIE,
};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use super::context::{FollowUp, Invocation, TransactionContext};
use crate::config::Config;
use crate::request::realm::AuthScheme;
use crate::request::{Cookie, RequestBody};
use crate::Error;

/// Decide whether to follow a redirect `status`.
///
/// `Ok(None)` delivers the response as is when there is no usable
/// `Location`. Loops, including a `Location` pointing back at the current
/// URL, are bounded only by the configured maximum, which fails the
/// transaction before any follow-up is made.
pub(crate) fn follow(
    ctx: &TransactionContext,
    status: StatusCode,
    headers: &HeaderMap,
    config: &Config,
    keep_alive: bool,
) -> Result<Option<FollowUp>, Error> {
    if ctx.redirect_count + 1 > config.max_redirects {
        return Err(Error::MaxRedirects(config.max_redirects));
    }

    let request = &ctx.request;
    let Some(location) = headers.get(LOCATION).and_then(|value| value.to_str().ok()) else {
        debug!(%status, "redirect without a location");
        return Ok(None);
    };

    let target = match resolve(request.uri(), location) {
        Some(target) => target,
        None => {
            debug!(%status, location, "unusable redirect location");
            return Ok(None);
        }
    };

    let method = request.method();
    let switch_to_get = !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
        && (status == StatusCode::MOVED_PERMANENTLY
            || status == StatusCode::SEE_OTHER
            || (status == StatusCode::FOUND && !config.strict_302_handling));
    let keep_body = !switch_to_get
        && (status == StatusCode::TEMPORARY_REDIRECT
            || status == StatusCode::PERMANENT_REDIRECT
            || (status == StatusCode::FOUND && config.strict_302_handling));

    let stays_on_origin = same_origin(request.uri(), &target);
    let mut builder = request
        .to_builder()
        .url(target.to_string())
        .remove_header(HOST)
        .remove_header(CONTENT_LENGTH)
        .cookies(propagated_cookies(request.cookies(), headers));

    if !stays_on_origin {
        builder = builder.clear_virtual_host();
    }
    if switch_to_get {
        builder = builder.method(Method::GET);
    }
    if !keep_body {
        builder = builder.body(RequestBody::Empty).remove_header(CONTENT_TYPE);
    }
    if config
        .realm_for(request)
        .is_some_and(|realm| realm.scheme() == AuthScheme::Ntlm)
    {
        builder = builder
            .remove_header(AUTHORIZATION)
            .remove_header(PROXY_AUTHORIZATION);
    }

    let reuse_connection = keep_alive && stays_on_origin;
    debug!(%status, from = %request.uri(), to = %target, reuse_connection, "following redirect");

    Ok(Some(FollowUp {
        request: builder.build()?,
        invocation: Invocation::Continue,
        reuse_connection,
        redirect: Some(target),
    }))
}

fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&base.to_string()).ok()?;
    let mut target = base.join(location).ok()?;
    target.set_fragment(None);
    target.as_str().parse().ok()
}

fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or(match uri.scheme_str() {
        Some("https" | "wss") => Some(443),
        Some("http" | "ws") => Some(80),
        _ => None,
    })
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme() == b.scheme()
        && a.host().map(str::to_ascii_lowercase) == b.host().map(str::to_ascii_lowercase)
        && default_port(a) == default_port(b)
}

/// Cookies for the follow-up: the request's own, replaced or extended by
/// any the redirect response set.
fn propagated_cookies(existing: &[Cookie], headers: &HeaderMap) -> Vec<Cookie> {
    let mut cookies = existing.to_vec();
    for set_cookie in headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
    {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let cookie = Cookie::new(name, value.trim().trim_matches('"'));
        match cookies.iter_mut().find(|c| c.name() == name) {
            Some(slot) => *slot = cookie,
            None => cookies.push(cookie),
        }
    }
    cookies
}
