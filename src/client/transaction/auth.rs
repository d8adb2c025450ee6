//! Answering `401` and `407` challenges.

use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method};
use tracing::debug;

use super::context::{FollowUp, Invocation, TransactionContext};
use crate::auth::{
    basic_authorization, digest_authorization, header_with_prefix, negotiate, ntlm_authenticate,
    ntlm_negotiate,
};
use crate::config::Config;
use crate::request::realm::{AuthScheme, Realm};
use crate::request::Request;
use crate::Error;

/// Who issued the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthTarget {
    Origin,
    Proxy,
}

impl AuthTarget {
    fn challenge(self) -> HeaderName {
        match self {
            AuthTarget::Origin => WWW_AUTHENTICATE,
            AuthTarget::Proxy => PROXY_AUTHENTICATE,
        }
    }

    pub(crate) fn credentials(self) -> HeaderName {
        match self {
            AuthTarget::Origin => AUTHORIZATION,
            AuthTarget::Proxy => PROXY_AUTHORIZATION,
        }
    }
}

/// Credentials answering a challenge.
#[derive(Debug)]
pub(crate) struct Answer {
    pub(crate) value: HeaderValue,
    pub(crate) invocation: Invocation,
    pub(crate) realm: Option<Realm>,
}

fn realm_for<'a>(request: &'a Request, config: &'a Config, target: AuthTarget) -> Option<&'a Realm> {
    match target {
        AuthTarget::Origin => config.realm_for(request).filter(|realm| !realm.target_proxy()),
        AuthTarget::Proxy => config
            .proxy_for(request)
            .and_then(|proxy| proxy.realm())
            .or_else(|| config.realm_for(request).filter(|realm| realm.target_proxy())),
    }
}

/// Compute credentials for the challenge in `headers`.
///
/// `connect` names the `host:port` of a CONNECT request being answered,
/// which then stands in for the request's method and URI. `Ok(None)` means
/// the challenge cannot be answered and the response is delivered as is.
pub(crate) fn answer(
    request: &Request,
    headers: &HeaderMap,
    config: &Config,
    target: AuthTarget,
    connect: Option<&str>,
) -> Result<Option<Answer>, Error> {
    let Some(realm) = realm_for(request, config, target) else {
        debug!(?target, "challenged without a realm");
        return Ok(None);
    };

    let name = target.challenge();
    if !headers.contains_key(&name) {
        debug!(?target, "challenged without a challenge header");
        return Ok(None);
    }

    let negotiate_challenge = header_with_prefix(headers, &name, "Negotiate");
    if negotiate_challenge.is_some()
        && matches!(realm.scheme(), AuthScheme::Spnego | AuthScheme::Kerberos)
    {
        if let Some(engine) = config.spnego_engine.as_deref() {
            let host = request.uri().host().unwrap_or_default();
            return Ok(Some(Answer {
                value: negotiate(engine, host)?,
                invocation: Invocation::Stop,
                realm: None,
            }));
        }
    }

    if let (Some(challenge), Some(engine)) = (
        header_with_prefix(headers, &name, "NTLM"),
        config.ntlm_engine.as_deref(),
    ) {
        let token = challenge[4..].trim();
        if token.is_empty() {
            let already_sent = header_with_prefix(request.headers(), &target.credentials(), "NTLM");
            if already_sent.is_some() {
                debug!("NTLM challenge repeated without a token");
                return Ok(None);
            }
            return Ok(Some(Answer {
                value: ntlm_negotiate(engine, realm)?,
                invocation: Invocation::Continue,
                realm: None,
            }));
        }
        return Ok(Some(Answer {
            value: ntlm_authenticate(engine, realm, token)?,
            invocation: Invocation::Stop,
            realm: None,
        }));
    }

    let Some(challenge) = header_with_prefix(headers, &name, "Digest")
        .or_else(|| header_with_prefix(headers, &name, "Basic"))
    else {
        debug!(?target, "no supported challenge");
        return Ok(None);
    };

    let builder = match target {
        AuthTarget::Origin => realm.to_builder().parse_www_authenticate(challenge),
        AuthTarget::Proxy => realm.to_builder().parse_proxy_authenticate(challenge),
    };
    let builder = match connect {
        Some(authority) => builder.method(Method::CONNECT).uri(authority),
        None => builder
            .method(request.method().clone())
            .request_uri(request.uri()),
    };
    let realm = builder.build();

    let value = match realm.scheme() {
        AuthScheme::Digest => digest_authorization(&realm)?,
        _ => basic_authorization(&realm)?,
    };

    Ok(Some(Answer {
        value,
        invocation: Invocation::Stop,
        realm: Some(realm),
    }))
}

/// The retried request answering a `401` or `407`, if the challenge can be answered.
pub(crate) fn follow(
    ctx: &TransactionContext,
    headers: &HeaderMap,
    config: &Config,
    keep_alive: bool,
    target: AuthTarget,
) -> Result<Option<FollowUp>, Error> {
    let request = &ctx.request;
    let Some(answer) = answer(request, headers, config, target, None)? else {
        return Ok(None);
    };

    let mut builder = request
        .to_builder()
        .remove_header(HOST)
        .remove_header(CONTENT_LENGTH)
        .set_header(target.credentials(), answer.value);
    if let (AuthTarget::Origin, Some(realm)) = (target, answer.realm) {
        builder = builder.realm(realm);
    }

    debug!(?target, invocation = ?answer.invocation, "retrying with credentials");
    Ok(Some(FollowUp {
        request: builder.build()?,
        invocation: answer.invocation,
        reuse_connection: keep_alive,
        redirect: None,
    }))
}
