//! Streaming HTTP/1.1 response parser.
//!
//! One `ResponseReader` lives for one request attempt. Bytes are fed in
//! whatever slices the socket hands us; an incomplete trailing line is kept
//! in a bounded carry buffer and prepended to the next feed, so the input
//! may be split at any byte boundary.

use thiserror::Error;

/// Upper bound on header bytes carried across feeds.
const MAX_CARRY_BYTES: usize = 1024 * 50;
/// A chunk length line is a short hex number; anything longer is garbage.
const MAX_CHUNK_LEN_LINE_BYTES: usize = 20;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("status line spanning multiple reads too long")]
    StatusLineTooLong,
    #[error("invalid status line")]
    InvalidStatusLine,
    #[error("no status code in status line")]
    MissingStatusCode,
    #[error("header line spanning multiple reads too long")]
    HeaderTooLong,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("invalid content-length header")]
    InvalidContentLength,
    #[error("chunk length line too long")]
    ChunkLenLineTooLong,
    #[error("invalid chunk length")]
    InvalidChunkLength,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    StatusLine,
    HeaderLine,
    BodyContentLength,
    ChunkLenLine,
    ChunkBytes,
    Done,
}

#[derive(Debug, Default)]
pub struct ResponseReader {
    pub response_code: u16,
    pub body_bytes_read: usize,
    state: State,
    carry: Vec<u8>,
    content_length: usize,
    chunked: bool,
    cur_chunk_len: usize,
    cur_chunk_read: usize,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next slice of response bytes. Returns `Ok(true)` once the
    /// whole response has been seen; extra bytes past the end are ignored.
    /// Trailers after a chunked body are not consumed: the zero-length chunk
    /// alone completes the response.
    pub fn feed(&mut self, input: &[u8]) -> Result<bool, ReadError> {
        let joined;
        let mut bb: &[u8] = if self.carry.is_empty() {
            input
        } else {
            self.carry.extend_from_slice(input);
            joined = std::mem::take(&mut self.carry);
            &joined
        };

        loop {
            match self.state {
                State::StatusLine => {
                    let Some(n) = find_byte(bb, b'\n') else {
                        if bb.len() > MAX_CARRY_BYTES {
                            return Err(ReadError::StatusLineTooLong);
                        }
                        self.carry = bb.to_vec();
                        return Ok(false);
                    };
                    let line = &bb[..n];
                    bb = &bb[n + 1..];

                    // Skip past the HTTP version.
                    let sp = find_byte(line, b' ').ok_or(ReadError::InvalidStatusLine)?;
                    let rest = &line[sp + 1..];
                    let code_end = find_byte(rest, b' ').unwrap_or(rest.len());
                    self.response_code = std::str::from_utf8(&rest[..code_end])
                        .ok()
                        .and_then(|s| s.trim_end_matches('\r').parse().ok())
                        .ok_or(ReadError::MissingStatusCode)?;

                    self.state = State::HeaderLine;
                }
                State::HeaderLine => {
                    let Some(n) = find_byte(bb, b'\n') else {
                        if bb.len() > MAX_CARRY_BYTES {
                            return Err(ReadError::HeaderTooLong);
                        }
                        self.carry = bb.to_vec();
                        return Ok(false);
                    };
                    let mut line = &bb[..n];
                    if line.last() == Some(&b'\r') {
                        line = &line[..line.len() - 1];
                    }
                    bb = &bb[n + 1..];

                    if line.is_empty() {
                        // Blank line ends the headers.
                        self.state = if self.chunked {
                            State::ChunkLenLine
                        } else {
                            State::BodyContentLength
                        };
                        continue;
                    }

                    let colon = find_byte(line, b':').ok_or(ReadError::InvalidHeader)?;
                    let name = line[..colon].trim_ascii();
                    let value = line[colon + 1..].trim_ascii();
                    if name.eq_ignore_ascii_case(b"Content-Length") {
                        self.content_length = std::str::from_utf8(value)
                            .ok()
                            .and_then(|s| s.parse().ok())
                            .ok_or(ReadError::InvalidContentLength)?;
                    } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
                        self.chunked = value.eq_ignore_ascii_case(b"chunked");
                    }
                }
                State::BodyContentLength => {
                    // A missing Content-Length header leaves the expected
                    // length at zero, completing right after the headers.
                    let remaining = self.content_length - self.body_bytes_read;
                    let n = bb.len().min(remaining);
                    self.body_bytes_read += n;
                    if self.body_bytes_read == self.content_length {
                        self.state = State::Done;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                State::ChunkLenLine => {
                    let line = loop {
                        let Some(n) = find_byte(bb, b'\n') else {
                            if bb.len() > MAX_CHUNK_LEN_LINE_BYTES {
                                return Err(ReadError::ChunkLenLineTooLong);
                            }
                            self.carry = bb.to_vec();
                            return Ok(false);
                        };
                        let line = &bb[..n];
                        bb = &bb[n + 1..];
                        if line.trim_ascii().is_empty() {
                            // Line break left over from the previous chunk.
                            continue;
                        }
                        break line;
                    };

                    let len = std::str::from_utf8(line.trim_ascii())
                        .ok()
                        .and_then(|s| u64::from_str_radix(s, 16).ok())
                        .ok_or(ReadError::InvalidChunkLength)?;
                    self.cur_chunk_len = len as usize;
                    self.cur_chunk_read = 0;

                    if self.cur_chunk_len == 0 {
                        self.state = State::Done;
                        return Ok(true);
                    }
                    self.state = State::ChunkBytes;
                }
                State::ChunkBytes => {
                    let remaining = self.cur_chunk_len - self.cur_chunk_read;
                    let n = bb.len().min(remaining);
                    self.cur_chunk_read += n;
                    self.body_bytes_read += n;
                    bb = &bb[n..];
                    if self.cur_chunk_read == self.cur_chunk_len {
                        self.state = State::ChunkLenLine;
                        if !bb.is_empty() {
                            continue;
                        }
                    }
                    return Ok(false);
                }
                State::Done => return Ok(true),
            }
        }
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Turns readable test fixtures into proper CRLF wire format.
    fn crlf(text: &str) -> Vec<u8> {
        text.replace('\r', "").replace('\n', "\r\n").into_bytes()
    }

    #[test]
    fn test_simple_response() {
        let resp = crlf("HTTP/1.1 200 OK\nServer: nginx/1.10.3 (Ubuntu)\nDate: Tue, 12 Jun 2018 18:09:49 GMT\nContent-Type: text/html\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(true));
        assert_eq!(r.response_code, 200);
        assert_eq!(r.body_bytes_read, 2);
    }

    /// Splits the response at every possible position and feeds it in two
    /// parts; the parse must come out identical to a single feed.
    #[test]
    fn test_response_split_at_every_position() {
        let resp = crlf("HTTP/1.1 200 OK\nServer: nginx/1.10.3 (Ubuntu)\nDate: Tue, 12 Jun 2018 18:09:49 GMT\nContent-Type: text/html\nContent-Length: 2\n\nHi");
        for i in 0..resp.len() {
            let mut r = ResponseReader::new();
            assert_eq!(r.feed(&resp[..i]), Ok(false), "split at {i}");
            assert_eq!(r.feed(&resp[i..]), Ok(true), "split at {i}");
            assert_eq!(r.response_code, 200, "split at {i}");
            assert_eq!(r.body_bytes_read, 2, "split at {i}");
        }
    }

    #[test]
    fn test_status_line_without_spaces() {
        let resp = crlf("HTTP/1.1200OK\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::InvalidStatusLine));
    }

    #[test]
    fn test_status_line_with_joined_code_and_reason() {
        let resp = crlf("HTTP/1.1 200OK\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::MissingStatusCode));
    }

    #[test]
    fn test_status_line_with_non_numeric_code() {
        let resp = crlf("HTTP/1.1 200x OK\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::MissingStatusCode));
    }

    #[test]
    fn test_feeding_after_done_stays_done() {
        let resp = crlf("HTTP/1.1 200 OK\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(true));
        assert_eq!(r.feed(&[]), Ok(true));
        assert_eq!(r.response_code, 200);
        assert_eq!(r.body_bytes_read, 2);
    }

    #[test]
    fn test_oversized_status_line() {
        let mut text = String::from("HTTP/1.1 200 OK xxxxxxxxxx");
        for _ in 0..(1024 * 60) / 10 {
            text.push_str("xxxxxxxxxx");
        }
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&crlf(&text)), Err(ReadError::StatusLineTooLong));
    }

    #[test]
    fn test_oversized_header_line() {
        let mut text = String::from("HTTP/1.1 200 OK\nServer: xxxxxxxxx");
        for _ in 0..(1024 * 60) / 10 {
            text.push_str("xxxxxxxxxx");
        }
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&crlf(&text)), Err(ReadError::HeaderTooLong));
    }

    #[test]
    fn test_no_content_length_completes_after_headers() {
        let resp = crlf("HTTP/1.1 200 OK\nServer: nginx/1.10.3 (Ubuntu)\nContent-Type: text/html\n\nthis should be ignored\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(true));
        assert_eq!(r.response_code, 200);
        assert_eq!(r.body_bytes_read, 0);
    }

    #[test]
    fn test_no_headers_at_all() {
        let resp = crlf("HTTP/1.1 200 OK\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(true));
        assert_eq!(r.response_code, 200);
        assert_eq!(r.body_bytes_read, 0);
    }

    #[test]
    fn test_incomplete_headers_want_more() {
        let resp = crlf("HTTP/1.1 200 OK\nServer: nginx/1.10.3 (Ubuntu)\nDate: Tue, 12 Jun 2018 18:09:49 GMT");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(false));
    }

    #[test]
    fn test_header_without_colon() {
        let resp = crlf("HTTP/1.1 200 OK\nServer: nginx/1.10.3 (Ubuntu)\nsomeStrangeHeaderWithoutDelimiter\nContent-Length: 2\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::InvalidHeader));
    }

    #[test]
    fn test_non_numeric_content_length() {
        let resp = crlf("HTTP/1.1 200 OK\nContent-Length: abc\n\nHi\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::InvalidContentLength));
    }

    #[test]
    fn test_incomplete_body_wants_more() {
        let resp = crlf("HTTP/1.1 200 OK\nContent-Length: 3\n\nHi");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(false));
    }

    #[test]
    fn test_chunked_body() {
        let resp = crlf("HTTP/1.1 200 OK\nContent-Type: text/html\nTransfer-Encoding: chunked\n\n1A\n<hello><hello><hello></hel\n13\nlo></hello></hello>\n0\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(true));
        assert_eq!(r.response_code, 200);
        assert_eq!(r.body_bytes_read, 45);
    }

    /// Chunked at the HTTP level, split at every position at the TCP level.
    #[test]
    fn test_chunked_split_at_every_position() {
        let resp = crlf("HTTP/1.1 200 OK\nContent-Type: text/html\nTransfer-Encoding: chunked\n\n1A\n<hello><hello><hello></hel\n13\nlo></hello></hello>\n0\n");
        for i in 0..resp.len() {
            let mut r = ResponseReader::new();
            assert_eq!(r.feed(&resp[..i]), Ok(false), "split at {i}");
            assert_eq!(r.feed(&resp[i..]), Ok(true), "split at {i}");
            assert_eq!(r.response_code, 200, "split at {i}");
            assert_eq!(r.body_bytes_read, 45, "split at {i}");
        }
    }

    #[test]
    fn test_chunk_length_cut_short() {
        let resp = crlf("HTTP/1.1 200 OK\nTransfer-Encoding: chunked\n\n1A");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(false));
    }

    #[test]
    fn test_chunk_length_line_too_long() {
        let resp = crlf("HTTP/1.1 200 OK\nTransfer-Encoding: chunked\n\n1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::ChunkLenLineTooLong));
    }

    #[test]
    fn test_chunk_bytes_cut_short() {
        let resp = crlf("HTTP/1.1 200 OK\nTransfer-Encoding: chunked\n\n1A\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(false));
    }

    #[test]
    fn test_chunk_cut_short_between_chunks() {
        let resp = crlf("HTTP/1.1 200 OK\nTransfer-Encoding: chunked\n\n1A\n<hello><hello><hello></hel\n13\nlo></hello></hello>");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Ok(false));
    }

    #[test]
    fn test_invalid_chunk_length() {
        let resp = crlf("HTTP/1.1 200 OK\nTransfer-Encoding: chunked\n\n1G\n<hello><hello><hello></hel\n13\nlo></hello></hello>\n0\n\n");
        let mut r = ResponseReader::new();
        assert_eq!(r.feed(&resp), Err(ReadError::InvalidChunkLength));
    }
}
