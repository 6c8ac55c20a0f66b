//! The draft-76 upgrade handshake.
//!
//! A draft-76 upgrade request is an ordinary HTTP `GET` with a handful of
//! extra headers, followed by eight raw bytes of body:
//!
//! ```text
//! GET /demo HTTP/1.1
//! Host: example.com
//! Connection: Upgrade
//! Upgrade: WebSocket
//! Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5
//! Sec-WebSocket-Key2: 12998 5 Y3 1  .P00
//! Origin: http://example.com
//!
//! ^n:ds[4U
//! ```
//!
//! [`HandshakeNegotiator`] reads the request head, validates it, reads the
//! body token, computes the challenge response and writes either the `101`
//! upgrade response or a plain HTTP error. The negotiator moves through
//! [`HandshakeState`] as it goes:
//!
//! ```text
//! Init ──→ ValidatingHeaders ──┬──→ Responded
//!                              └──→ Failed
//! ```
//!
//! # Examples
//!
//! ```
//! use hixie_core::handshake::{HandshakeNegotiator, HandshakeState};
//!
//! # async fn example() {
//! let request: &[u8] = b"GET /demo HTTP/1.1\r\n\
//!     Host: example.com\r\n\
//!     Connection: Upgrade\r\n\
//!     Upgrade: WebSocket\r\n\
//!     Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
//!     Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\
//!     \r\n\
//!     ^n:ds[4U";
//!
//! let mut reader = request;
//! let mut response = Vec::new();
//! let mut negotiator = HandshakeNegotiator::new();
//!
//! let handshake = negotiator.negotiate(&mut reader, &mut response).await.unwrap();
//! assert_eq!(negotiator.state(), HandshakeState::Responded);
//! assert_eq!(handshake.location, "ws://example.com/demo");
//! assert!(response.ends_with(b"8jKS'y:G*Co,Wxa-"));
//! # }
//! ```

use crate::challenge::{self, KEY3_LEN};
use crate::error::HandshakeError;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use std::borrow::Cow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound on the request line plus all header lines.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

const KEY1: &str = "sec-websocket-key1";
const KEY2: &str = "sec-websocket-key2";
const ORIGIN: &str = "origin";
const PROTOCOL: &str = "sec-websocket-protocol";

/// Progress of a single handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing has been read yet.
    Init,
    /// The request head has been read and is being checked.
    ValidatingHeaders,
    /// The `101` response and challenge digest were written.
    Responded,
    /// The request was rejected.
    Failed,
}

/// A parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Request target as sent by the client, e.g. `/chat?room=1`
    pub path: String,
    /// Headers, looked up case-insensitively
    pub headers: HeaderMap,
}

impl Request {
    /// Returns a header value as text, if present.
    ///
    /// Bytes outside ASCII are replaced rather than rejected; the challenge
    /// keys only care about digits and spaces.
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        self.headers
            .get(name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()))
    }
}

/// The validated parts of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Value of `Sec-WebSocket-Key1`
    pub key1: String,
    /// Value of `Sec-WebSocket-Key2`
    pub key2: String,
    /// Value of `Host`
    pub host: String,
    /// Request target
    pub path: String,
    /// Value of `Origin`, if sent
    pub origin: Option<String>,
    /// Value of `Sec-WebSocket-Protocol`, if sent
    pub protocol: Option<String>,
}

impl UpgradeRequest {
    /// The `ws://` URL echoed back in `Sec-WebSocket-Location`.
    pub fn location(&self) -> String {
        format!("ws://{}{}", self.host, self.path)
    }
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Request target
    pub path: String,
    /// The URL sent in `Sec-WebSocket-Location`
    pub location: String,
    /// Origin the client declared
    pub origin: Option<String>,
    /// Subprotocol the client requested, echoed verbatim
    pub protocol: Option<String>,
}

/// Drives one connection through the upgrade handshake.
#[derive(Debug)]
pub struct HandshakeNegotiator {
    state: HandshakeState,
}

impl HandshakeNegotiator {
    /// Creates a negotiator in [`HandshakeState::Init`].
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Init,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Performs the handshake on an accepted connection.
    ///
    /// On failure an HTTP error response matching [`HandshakeError::status`]
    /// is written (best effort) before the error is returned. The caller
    /// should then drop the socket.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::MethodNotAllowed`] for anything but `GET`
    /// - [`HandshakeError::BadRequest`] for a malformed head, missing headers,
    ///   a bad challenge key or a truncated body
    /// - [`HandshakeError::Unsupported`] for a different upgrade protocol
    /// - [`HandshakeError::Io`] if the socket fails
    pub async fn negotiate<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Handshake, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.try_negotiate(reader, writer).await {
            Ok(handshake) => {
                self.state = HandshakeState::Responded;
                Ok(handshake)
            }
            Err(err) => {
                self.state = HandshakeState::Failed;
                warn!("Handshake rejected: {}", err);
                if !matches!(err, HandshakeError::Io(_)) {
                    let response = error_response(err.status());
                    if let Err(e) = write_all_flush(writer, &response).await {
                        debug!("Failed to write handshake error response: {}", e);
                    }
                }
                Err(err)
            }
        }
    }

    async fn try_negotiate<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Handshake, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request = read_request(reader).await?;
        self.state = HandshakeState::ValidatingHeaders;
        debug!("Upgrade request for {} {}", request.method, request.path);

        let upgrade = validate(&request)?;
        let key3 = read_key3(reader).await?;
        let digest = challenge::compute(&upgrade.key1, &upgrade.key2, &key3)?;

        let response = upgrade_response(&upgrade, &digest);
        write_all_flush(writer, &response).await?;

        Ok(Handshake {
            location: upgrade.location(),
            path: upgrade.path,
            origin: upgrade.origin,
            protocol: upgrade.protocol,
        })
    }
}

impl Default for HandshakeNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads an HTTP request line and headers, stopping after the blank line.
///
/// Both CRLF and bare LF line endings are accepted. Any body bytes are left
/// unread in `reader`.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_LEN as u64;

    let request_line = next_line(reader, &mut budget).await?;
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) => (method, path, version),
        _ => {
            return Err(HandshakeError::bad_request(format!(
                "malformed request line: {:?}",
                request_line
            )));
        }
    };
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::bad_request(format!(
            "unsupported protocol version: {}",
            version
        )));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| HandshakeError::bad_request(format!("invalid method: {}", method)))?;
    let path = path.to_string();

    let mut headers = HeaderMap::new();
    loop {
        let line = next_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::bad_request(format!("malformed header: {:?}", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HandshakeError::bad_request(format!("invalid header name: {:?}", name)))?;
        // Trailing spaces are significant in the challenge keys.
        let value = HeaderValue::from_bytes(value.trim_start_matches([' ', '\t']).as_bytes())
            .map_err(|_| HandshakeError::bad_request(format!("invalid value for {}", name)))?;
        headers.append(name, value);
    }

    Ok(Request {
        method,
        path,
        headers,
    })
}

async fn next_line<R>(reader: &mut R, budget: &mut u64) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget)
        .read_line(&mut line)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                HandshakeError::bad_request("request head is not valid UTF-8")
            }
            _ => HandshakeError::Io(e),
        })?;
    *budget -= read as u64;

    if !line.ends_with('\n') {
        return Err(if *budget == 0 {
            HandshakeError::bad_request("request head too large")
        } else {
            HandshakeError::bad_request("connection closed inside request head")
        });
    }

    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Checks the upgrade headers of a parsed request.
///
/// Checks run in a fixed order so the first problem found decides the
/// status code: method, `Connection`, `Upgrade`, the two key headers, then
/// `Host`.
pub fn validate(request: &Request) -> Result<UpgradeRequest, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::MethodNotAllowed(request.method.to_string()));
    }

    match request.header("connection") {
        Some(value) if value == "Upgrade" => {}
        Some(value) => {
            return Err(HandshakeError::bad_request(format!(
                "expected Connection: Upgrade, got {:?}",
                value
            )));
        }
        None => return Err(HandshakeError::bad_request("missing Connection header")),
    }

    match request.header("upgrade") {
        Some(value) if value == "WebSocket" => {}
        Some(value) => return Err(HandshakeError::Unsupported(value.into_owned())),
        None => return Err(HandshakeError::bad_request("missing Upgrade header")),
    }

    let key1 = request
        .header(KEY1)
        .ok_or_else(|| HandshakeError::bad_request("missing Sec-WebSocket-Key1 header"))?;
    let key2 = request
        .header(KEY2)
        .ok_or_else(|| HandshakeError::bad_request("missing Sec-WebSocket-Key2 header"))?;
    let host = request
        .header("host")
        .ok_or_else(|| HandshakeError::bad_request("missing Host header"))?;

    Ok(UpgradeRequest {
        key1: key1.into_owned(),
        key2: key2.into_owned(),
        host: host.into_owned(),
        path: request.path.clone(),
        origin: request.header(ORIGIN).map(Cow::into_owned),
        protocol: request.header(PROTOCOL).map(Cow::into_owned),
    })
}

async fn read_key3<R>(reader: &mut R) -> Result<[u8; KEY3_LEN], HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut key3 = [0u8; KEY3_LEN];
    match reader.read_exact(&mut key3).await {
        Ok(_) => Ok(key3),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            HandshakeError::bad_request("request body shorter than 8 bytes"),
        ),
        Err(e) => Err(HandshakeError::Io(e)),
    }
}

/// Builds the `101` response followed by the challenge digest.
pub fn upgrade_response(upgrade: &UpgradeRequest, digest: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
    buf.put_slice(b"Upgrade: WebSocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    if let Some(origin) = &upgrade.origin {
        put_header(&mut buf, "Sec-WebSocket-Origin", origin);
    }
    put_header(&mut buf, "Sec-WebSocket-Location", &upgrade.location());
    if let Some(protocol) = &upgrade.protocol {
        put_header(&mut buf, "Sec-WebSocket-Protocol", protocol);
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(digest);
    buf.to_vec()
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Builds a complete plain-text HTTP error response.
///
/// # Examples
///
/// ```
/// use hixie_core::handshake::error_response;
/// use http::StatusCode;
///
/// let response = error_response(StatusCode::BAD_REQUEST);
/// assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
/// ```
pub fn error_response(status: StatusCode) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!("{} {}\n", status.as_u16(), reason);

    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status.as_u16(),
        reason,
        body.len()
    );

    let mut response = head.into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY3: &[u8] = b"^n:ds[4U";

    fn upgrade_head(extra: &str) -> String {
        format!(
            "GET /demo HTTP/1.1\r\n\
             Host: example.com\r\n\
             Connection: Upgrade\r\n\
             Upgrade: WebSocket\r\n\
             Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
             Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\
             {}\r\n",
            extra
        )
    }

    async fn run(request: &[u8]) -> (Result<Handshake, HandshakeError>, HandshakeState, Vec<u8>) {
        let mut reader = request;
        let mut writer = Vec::new();
        let mut negotiator = HandshakeNegotiator::new();
        let result = negotiator.negotiate(&mut reader, &mut writer).await;
        (result, negotiator.state(), writer)
    }

    fn with_body(head: String, body: &[u8]) -> Vec<u8> {
        let mut request = head.into_bytes();
        request.extend_from_slice(body);
        request
    }

    #[tokio::test]
    async fn test_reference_handshake() {
        let request = with_body(
            upgrade_head("Origin: http://example.com\r\nSec-WebSocket-Protocol: sample\r\n"),
            KEY3,
        );
        let (result, state, response) = run(&request).await;

        let handshake = result.unwrap();
        assert_eq!(state, HandshakeState::Responded);
        assert_eq!(handshake.path, "/demo");
        assert_eq!(handshake.origin.as_deref(), Some("http://example.com"));
        assert_eq!(handshake.protocol.as_deref(), Some("sample"));

        let expected: &[u8] = b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
            Upgrade: WebSocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Origin: http://example.com\r\n\
            Sec-WebSocket-Location: ws://example.com/demo\r\n\
            Sec-WebSocket-Protocol: sample\r\n\
            \r\n\
            8jKS'y:G*Co,Wxa-";
        assert_eq!(response, expected);
    }

    #[tokio::test]
    async fn test_optional_headers_omitted() {
        let request = with_body(upgrade_head(""), KEY3);
        let (result, _, response) = run(&request).await;
        assert!(result.is_ok());

        let text = String::from_utf8_lossy(&response);
        assert!(!text.contains("Sec-WebSocket-Origin"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
        assert!(text.contains("Sec-WebSocket-Location: ws://example.com/demo\r\n"));
    }

    #[tokio::test]
    async fn test_body_bytes_after_key3_stay_unread() {
        let request = with_body(upgrade_head(""), b"^n:ds[4U\x00hi\xff");
        let mut reader = &request[..];
        let mut writer = Vec::new();
        HandshakeNegotiator::new()
            .negotiate(&mut reader, &mut writer)
            .await
            .unwrap();
        assert_eq!(reader, b"\x00hi\xff");
    }

    #[tokio::test]
    async fn test_header_names_are_case_insensitive() {
        let request = b"GET / HTTP/1.1\n\
            host: localhost:8888\n\
            connection: Upgrade\n\
            UPGRADE: WebSocket\n\
            sec-websocket-key1: 4 @1  46546xW%0l 1 5\n\
            SEC-WEBSOCKET-KEY2: 12998 5 Y3 1  .P00\n\
            \n\
            ^n:ds[4U";
        let (result, _, response) = run(request).await;
        assert_eq!(result.unwrap().location, "ws://localhost:8888/");
        assert!(response.ends_with(b"8jKS'y:G*Co,Wxa-"));
    }

    #[tokio::test]
    async fn test_wrong_connection_header() {
        let request = with_body(
            upgrade_head("").replace("Connection: Upgrade", "Connection: keep-alive"),
            KEY3,
        );
        let (result, state, response) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
        assert_eq!(state, HandshakeState::Failed);
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_rfc6455_upgrade_is_unsupported() {
        let request = with_body(
            upgrade_head("").replace("Upgrade: WebSocket", "Upgrade: websocket"),
            KEY3,
        );
        let (result, state, response) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::Unsupported(ref u)) if u == "websocket"));
        assert_eq!(state, HandshakeState::Failed);
        assert!(response.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn test_missing_upgrade_header() {
        let request = with_body(upgrade_head("").replace("Upgrade: WebSocket\r\n", ""), KEY3);
        let (result, _, response) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
        assert!(response.starts_with(b"HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_missing_key_header() {
        let request = with_body(
            upgrade_head("").replace("Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n", ""),
            KEY3,
        );
        let (result, _, _) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(ref r)) if r.contains("Key2")));
    }

    #[tokio::test]
    async fn test_missing_host_header() {
        let request = with_body(upgrade_head("").replace("Host: example.com\r\n", ""), KEY3);
        let (result, _, _) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(ref r)) if r.contains("Host")));
    }

    #[tokio::test]
    async fn test_bad_challenge_key_is_bad_request() {
        let request = with_body(
            upgrade_head("").replace("4 @1  46546xW%0l 1 5", "4146546015"),
            KEY3,
        );
        let (result, state, response) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
        assert_eq!(state, HandshakeState::Failed);
        assert!(response.starts_with(b"HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_short_body() {
        let request = with_body(upgrade_head(""), b"^n:d");
        let (result, _, _) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(ref r)) if r.contains("8 bytes")));
    }

    #[tokio::test]
    async fn test_post_is_rejected() {
        let request = with_body(upgrade_head("").replacen("GET", "POST", 1), KEY3);
        let (result, _, response) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::MethodNotAllowed(ref m)) if m == "POST"));
        assert!(response.starts_with(b"HTTP/1.1 405 Method Not Allowed\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let (result, _, _) = run(b"HELLO\r\n\r\n").await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let huge = format!("X-Filler: {}\r\n", "a".repeat(MAX_HEAD_LEN));
        let request = with_body(upgrade_head(&huge), KEY3);
        let (result, _, _) = run(&request).await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(ref r)) if r.contains("too large")));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_head() {
        let (result, state, response) = run(b"GET / HTTP/1.1\r\nHost: x").await;
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
        assert_eq!(state, HandshakeState::Failed);
        assert!(response.starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn test_error_response_format() {
        let response = error_response(StatusCode::NOT_IMPLEMENTED);
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
        assert!(text.contains("Content-Length: 20\r\n"));
        assert!(text.ends_with("\r\n\r\n501 Not Implemented\n"));
    }

    #[test]
    fn test_key_trailing_spaces_preserved() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("h"));
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("WebSocket"));
        headers.insert(KEY1, HeaderValue::from_static("1 0 "));
        headers.insert(KEY2, HeaderValue::from_static("2"));
        let request = Request {
            method: Method::GET,
            path: "/".into(),
            headers,
        };

        let upgrade = validate(&request).unwrap();
        assert_eq!(upgrade.key1, "1 0 ");
        assert_eq!(upgrade.location(), "ws://h/");
    }
}
