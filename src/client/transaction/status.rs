//! Status handler lookup.

use http::StatusCode;

use super::context::Invocation;

/// Interceptor chosen by status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusHandler {
    Authorization,
    ProxyAuthorization,
    Redirect,
}

static HANDLERS: [(u16, StatusHandler); 7] = [
    (401, StatusHandler::Authorization),
    (407, StatusHandler::ProxyAuthorization),
    (301, StatusHandler::Redirect),
    (302, StatusHandler::Redirect),
    (303, StatusHandler::Redirect),
    (307, StatusHandler::Redirect),
    (308, StatusHandler::Redirect),
];

fn lookup(status: StatusCode) -> Option<StatusHandler> {
    HANDLERS
        .iter()
        .find(|(code, _)| *code == status.as_u16())
        .map(|(_, handler)| *handler)
}

/// The handler intercepting `status`, if any.
///
/// Nothing intercepts once the transaction was told to stop, and redirects
/// are only intercepted when they are allowed for the request.
pub(crate) fn select(
    status: StatusCode,
    invocation: Invocation,
    redirect_allowed: bool,
) -> Option<StatusHandler> {
    if invocation == Invocation::Stop {
        return None;
    }
    match lookup(status)? {
        StatusHandler::Redirect if !redirect_allowed => None,
        handler => Some(handler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    #[test]
    fn table() {
        assert_eq!(
            select(code(401), Invocation::Continue, false),
            Some(StatusHandler::Authorization)
        );
        assert_eq!(
            select(code(407), Invocation::Continue, false),
            Some(StatusHandler::ProxyAuthorization)
        );
        for redirect in [301, 302, 303, 307, 308] {
            assert_eq!(
                select(code(redirect), Invocation::Continue, true),
                Some(StatusHandler::Redirect),
                "{redirect}"
            );
        }
        for other in [200, 300, 304, 305, 400, 403, 500] {
            assert_eq!(select(code(other), Invocation::Continue, true), None, "{other}");
        }
    }

    #[test]
    fn redirects_need_permission() {
        assert_eq!(select(code(302), Invocation::Continue, false), None);
        assert_eq!(
            select(code(401), Invocation::Continue, false),
            Some(StatusHandler::Authorization)
        );
    }

    #[test]
    fn stop_delivers_everything() {
        for status in [301, 401, 407] {
            assert_eq!(select(code(status), Invocation::Stop, true), None);
        }
    }
}
