//! Server side of the RFC 6455 opening handshake.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::digest;

use crate::error::HandshakeError;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A request whose header block has not ended within this many bytes is
/// rejected instead of buffered forever.
pub const MAX_REQUEST_LEN: usize = 8 * 1024;

/// Parsed view of the upgrade request. Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parses the request line and headers. On success also returns the
    /// number of bytes the header block occupied.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), HandshakeError> {
        let Some(end) = find_header_end(buf) else {
            if buf.len() > MAX_REQUEST_LEN {
                return Err(HandshakeError::MalformedRequest("header block too large"));
            }
            return Err(HandshakeError::Incomplete);
        };

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| HandshakeError::MalformedRequest("request is not UTF-8"))?;
        let mut lines = head.split("\r\n");

        let request_line = lines
            .next()
            .ok_or(HandshakeError::MalformedRequest("empty request"))?;
        let mut parts = request_line.split(' ').filter(|part| !part.is_empty());
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::MalformedRequest("bad request line"));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HandshakeError::MalformedRequest("unsupported HTTP version"));
        }

        let mut headers = HashMap::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or(HandshakeError::MalformedRequest("header without colon"))?;
            // Duplicates: the last one wins.
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok((
            Self {
                method: method.to_string(),
                path: path.to_string(),
                headers,
            },
            end + 4,
        ))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Accepted upgrade: the parsed request plus the 101 response to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub request: HandshakeRequest,
    pub accept: String,
    /// Bytes of the input that belonged to the request. Anything after this
    /// offset is already WebSocket frame data.
    pub consumed: usize,
}

impl HandshakeResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            self.accept
        )
        .into_bytes()
    }
}

/// Validates an upgrade request and computes the accept key.
pub fn negotiate(buf: &[u8]) -> Result<HandshakeResponse, HandshakeError> {
    let (request, consumed) = HandshakeRequest::parse(buf)?;

    if request.method != "GET" {
        return Err(HandshakeError::UnsupportedMethod(request.method));
    }

    let upgrade = request.header("upgrade").ok_or(HandshakeError::MissingUpgrade)?;
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingKey)?;
    match BASE64.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    let accept = accept_key(key);
    Ok(HandshakeResponse {
        request,
        accept,
        consumed,
    })
}

/// `base64(sha1(key + GUID))`
pub fn accept_key(key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(key.as_bytes());
    ctx.update(WS_GUID.as_bytes());
    BASE64.encode(ctx.finish().as_ref())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[test]
    fn rfc_worked_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let response = negotiate(SAMPLE.as_bytes()).unwrap();
        assert_eq!(response.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.consumed, SAMPLE.len());
        assert_eq!(response.request.path, "/chat");
        assert_eq!(
            response.to_bytes(),
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              \r\n"
                .to_vec()
        );
    }

    #[test]
    fn incomplete_until_blank_line() {
        let bytes = SAMPLE.as_bytes();
        assert_eq!(negotiate(&bytes[..bytes.len() - 2]), Err(HandshakeError::Incomplete));
        assert_eq!(negotiate(b""), Err(HandshakeError::Incomplete));
    }

    #[test]
    fn trailing_frame_bytes_not_consumed() {
        let mut bytes = SAMPLE.as_bytes().to_vec();
        bytes.extend_from_slice(&[0x81, 0x80, 0, 0, 0, 0]);
        assert_eq!(negotiate(&bytes).unwrap().consumed, SAMPLE.len());
    }

    #[test]
    fn header_names_case_insensitive_last_wins() {
        let request = "GET / HTTP/1.1\r\n\
            UPGRADE: WebSocket\r\n\
            sec-websocket-key: AAAAAAAAAAAAAAAAAAAAAA==\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let response = negotiate(request.as_bytes()).unwrap();
        assert_eq!(response.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.request.header("Upgrade"), Some("WebSocket"));
    }

    #[test]
    fn validation_failures() {
        let post = SAMPLE.replacen("GET", "POST", 1);
        assert_eq!(
            negotiate(post.as_bytes()),
            Err(HandshakeError::UnsupportedMethod("POST".into()))
        );

        let no_upgrade = SAMPLE.replace("Upgrade: websocket\r\n", "");
        assert_eq!(negotiate(no_upgrade.as_bytes()), Err(HandshakeError::MissingUpgrade));

        let no_key = SAMPLE.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "");
        assert_eq!(negotiate(no_key.as_bytes()), Err(HandshakeError::MissingKey));

        let short_key = SAMPLE.replace("dGhlIHNhbXBsZSBub25jZQ==", "c2hvcnQ=");
        assert_eq!(negotiate(short_key.as_bytes()), Err(HandshakeError::InvalidKey));

        let not_base64 = SAMPLE.replace("dGhlIHNhbXBsZSBub25jZQ==", "!!!not base64!!!");
        assert_eq!(negotiate(not_base64.as_bytes()), Err(HandshakeError::InvalidKey));

        assert!(matches!(
            negotiate(b"GET /\r\n\r\n"),
            Err(HandshakeError::MalformedRequest(_))
        ));
        assert!(matches!(
            negotiate(&vec![b'a'; MAX_REQUEST_LEN + 1]),
            Err(HandshakeError::MalformedRequest(_))
        ));
    }
}
