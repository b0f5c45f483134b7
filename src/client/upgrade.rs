use http::{Response, StatusCode};
use hyper::Body;
use tokio_tungstenite::tungstenite as ws;

use crate::{Error, Result};

/// The channel-multiplexing subprotocols this client speaks, in preference
/// order. `v5` adds the close channel (255); `v4` is the JSON-`Status`
/// error-channel baseline. Anything else from the server is rejected.
///
/// There's no official documentation about this protocol, but it's described in
/// [`k8s.io/apiserver/pkg/util/wsstream/conn.go`](https://git.io/JLQED).
pub(crate) const WS_PROTOCOLS: [&str; 2] = ["v5.channel.k8s.io", "v4.channel.k8s.io"];

/// The negotiated channel subprotocol for a websocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// `v5.channel.k8s.io`: v4 plus the close channel
    V5,
    /// `v4.channel.k8s.io`: `Status` objects on the error channel
    V4,
}

impl StreamProtocol {
    /// The wire name of the subprotocol.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamProtocol::V5 => WS_PROTOCOLS[0],
            StreamProtocol::V4 => WS_PROTOCOLS[1],
        }
    }

    /// Whether stdin can be half-closed over this subprotocol.
    pub fn supports_stream_close(self) -> bool {
        matches!(self, StreamProtocol::V5)
    }

    fn from_header(value: &str) -> Option<StreamProtocol> {
        match value {
            v if v == WS_PROTOCOLS[0] => Some(StreamProtocol::V5),
            v if v == WS_PROTOCOLS[1] => Some(StreamProtocol::V4),
            _ => None,
        }
    }
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
/// This must be a nonce consisting of a randomly selected 16-byte value in base64.
pub(crate) fn sec_websocket_key() -> String {
    let r: [u8; 16] = rand::random();
    base64::encode(&r)
}

/// Verify the upgrade response according to RFC 6455, returning the
/// subprotocol the server selected.
///
/// Based on `tungstenite`, plus subprotocol verification against the
/// channel family.
pub(crate) fn verify_response(res: &Response<Body>, key: &str) -> Result<StreamProtocol> {
    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::ProtocolSwitch(res.status()));
    }

    let headers = res.headers();
    if !headers
        .get(http::header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::MissingUpgradeWebSocketHeader);
    }

    if !headers
        .get(http::header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("Upgrade"))
        .unwrap_or(false)
    {
        return Err(Error::MissingConnectionUpgradeHeader);
    }

    let accept_key = ws::handshake::derive_accept_key(key.as_ref());
    if !headers
        .get(http::header::SEC_WEBSOCKET_ACCEPT)
        .map(|h| h == &accept_key)
        .unwrap_or(false)
    {
        return Err(Error::SecWebSocketAcceptKeyMismatch);
    }

    headers
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
        .and_then(StreamProtocol::from_header)
        .ok_or(Error::SecWebSocketProtocolMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_response(key: &str, protocol: &str) -> Response<Body> {
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "Upgrade")
            .header(
                http::header::SEC_WEBSOCKET_ACCEPT,
                ws::handshake::derive_accept_key(key.as_ref()),
            )
            .header(http::header::SEC_WEBSOCKET_PROTOCOL, protocol)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn negotiates_both_channel_versions() {
        let key = sec_websocket_key();
        let res = upgrade_response(&key, "v5.channel.k8s.io");
        assert_eq!(verify_response(&res, &key).unwrap(), StreamProtocol::V5);
        let res = upgrade_response(&key, "v4.channel.k8s.io");
        assert_eq!(verify_response(&res, &key).unwrap(), StreamProtocol::V4);
    }

    #[test]
    fn rejects_foreign_subprotocols() {
        let key = sec_websocket_key();
        let res = upgrade_response(&key, "v3.channel.k8s.io");
        assert!(matches!(
            verify_response(&res, &key),
            Err(Error::SecWebSocketProtocolMismatch)
        ));
    }

    #[test]
    fn rejects_plain_responses() {
        let key = sec_websocket_key();
        let res = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            verify_response(&res, &key),
            Err(Error::ProtocolSwitch(_))
        ));
    }
}
