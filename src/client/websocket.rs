//! WebSocket opening handshake (RFC 6455 section 4).

use base64::Engine as _;
use http::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
    UPGRADE,
};
use http::{HeaderMap, StatusCode};
use rand::RngCore as _;
use sha1::{Digest as _, Sha1};

use crate::Error;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// The `Sec-WebSocket-Accept` a server must answer to `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

/// Add the upgrade headers to a request, returning the key that was sent.
pub(crate) fn apply(headers: &mut HeaderMap) -> Result<String, Error> {
    let key = generate_key();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        SEC_WEBSOCKET_KEY,
        HeaderValue::try_from(key.as_str())
            .map_err(|_| Error::WebSocketHandshake("generated key is not a header".into()))?,
    );
    headers
        .entry(SEC_WEBSOCKET_VERSION)
        .or_insert_with(|| HeaderValue::from_static("13"));
    Ok(key)
}

/// Check the server's answer to an upgrade request sent with `key`.
pub(crate) fn verify(status: StatusCode, headers: &HeaderMap, key: &str) -> Result<(), Error> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::WebSocketHandshake(format!(
            "expected 101 Switching Protocols, got {status}"
        )));
    }

    let upgrade = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::WebSocketHandshake(format!(
            "unexpected upgrade protocol {upgrade:?}"
        )));
    }

    let expected = accept_key(key);
    match headers.get(SEC_WEBSOCKET_ACCEPT) {
        Some(accept) if accept.as_bytes() == expected.as_bytes() => Ok(()),
        Some(_) => Err(Error::WebSocketHandshake(
            "Sec-WebSocket-Accept does not match".into(),
        )),
        None => Err(Error::WebSocketHandshake(
            "missing Sec-WebSocket-Accept".into(),
        )),
    }
}
