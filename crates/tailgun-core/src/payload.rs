//! Raw HTTP request payloads.
//!
//! A payload is built once per run and its bytes are replayed verbatim for
//! every request, so the hot path never touches header formatting.

use regex::bytes::Regex;
use thiserror::Error;

/// Replaced in the header block with the decimal length of the body.
const BODY_LENGTH_TOKEN: &[u8] = b"{{bodylength}}";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("could not find end of headers (\\r\\n\\r\\n) in request input")]
    MissingHeaderEnd,
}

#[derive(Debug, Clone)]
pub struct RequestPayload {
    pub bytes: Vec<u8>,
    /// Whether the request asks the server to keep the connection open;
    /// decides if finished sockets go back to the pool or get closed.
    pub keep_alive: bool,
}

impl RequestPayload {
    /// Builds a payload from a raw CRLF-delimited request template. The
    /// `{{bodylength}}` token in the header block is replaced with the
    /// decimal body length, and a non-empty body gets a terminating blank
    /// line appended.
    pub fn parse(input: &[u8]) -> Result<Self, PayloadError> {
        let header_end =
            find_subslice(input, b"\r\n\r\n").ok_or(PayloadError::MissingHeaderEnd)?;
        let header_len = header_end + 4;
        let body = &input[header_len..];

        let headers = replace_all(
            &input[..header_len],
            BODY_LENGTH_TOKEN,
            body.len().to_string().as_bytes(),
        );

        let keep_alive = Regex::new(r"(?i)\r\nconnection: *keep-alive\r\n")
            .expect("keep-alive pattern")
            .is_match(&headers);

        let mut bytes = headers;
        if !body.is_empty() {
            bytes.extend_from_slice(body);
            bytes.extend_from_slice(b"\r\n\r\n");
        }

        Ok(Self { bytes, keep_alive })
    }

    /// The request used when no request file is given.
    pub fn default_get() -> Self {
        Self::parse(
            b"GET / HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              User-Agent: tailgun/0.1.0\r\n\
              Accept: */*\r\n\
              Connection: Keep-Alive\r\n\
              \r\n",
        )
        .expect("built-in request is well-formed")
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn replace_all(input: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = find_subslice(rest, from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_length_substitution_and_body_termination() {
        let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: {{bodylength}}\r\n\r\nabcd";
        let payload = RequestPayload::parse(raw).unwrap();
        let text = String::from_utf8(payload.bytes).unwrap();
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nabcd\r\n\r\n"));
    }

    #[test]
    fn test_empty_body_appends_nothing() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let payload = RequestPayload::parse(raw).unwrap();
        assert_eq!(payload.bytes, raw);
    }

    #[test]
    fn test_keep_alive_detected_case_insensitively() {
        for header in ["Connection: keep-alive", "Connection: Keep-Alive", "CONNECTION:  KEEP-ALIVE"] {
            let raw = format!("GET / HTTP/1.1\r\n{header}\r\n\r\n");
            let payload = RequestPayload::parse(raw.as_bytes()).unwrap();
            assert!(payload.keep_alive, "{header}");
        }
    }

    #[test]
    fn test_connection_close_is_not_keep_alive() {
        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let payload = RequestPayload::parse(raw).unwrap();
        assert!(!payload.keep_alive);
    }

    #[test]
    fn test_missing_header_end_is_rejected() {
        assert!(RequestPayload::parse(b"GET / HTTP/1.1\r\nHost: h\r\n").is_err());
    }

    #[test]
    fn test_default_request_is_keep_alive() {
        let payload = RequestPayload::default_get();
        assert!(payload.keep_alive);
        assert!(payload.bytes.starts_with(b"GET / HTTP/1.1\r\n"));
        assert!(payload.bytes.ends_with(b"\r\n\r\n"));
    }
}
