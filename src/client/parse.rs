//! Response head and chunk-size-line parsing.

use crate::error::Parse;
use crate::{Error, Result};

/// What the tag machine needs from a parsed response head.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Head {
    pub(crate) status: u16,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) server: Option<String>,
}

/// Parse a complete head (caller located the terminating blank line).
pub(crate) fn parse_head(buf: &[u8]) -> Result<Head> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let parsed = response
        .parse(buf)
        .map_err(|_| Error::new_parse(Parse::Head))?;
    if !matches!(parsed, httparse::Status::Complete(_)) {
        return Err(Error::new_parse(Parse::Head));
    }
    let status = response.code.ok_or_else(|| Error::new_parse(Parse::Status))?;

    let mut content_length = None;
    let mut chunked = false;
    let mut server = None;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let text = std::str::from_utf8(header.value)
                .map_err(|_| Error::new_parse(Parse::Head))?;
            content_length = Some(
                text.trim()
                    .parse::<usize>()
                    .map_err(|_| Error::new_parse(Parse::Head))?,
            );
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let text = std::str::from_utf8(header.value).unwrap_or("");
            if text.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            } else {
                return Err(Error::new_parse(Parse::Chunk)
                    .with(format!("unsupported transfer encoding {:?}", text.trim())));
            }
        } else if header.name.eq_ignore_ascii_case("server") && server.is_none() {
            server = std::str::from_utf8(header.value)
                .ok()
                .map(|value| value.trim().to_owned());
        }
    }
    Ok(Head {
        status,
        content_length,
        chunked,
        server,
    })
}

/// Parse one chunk-size line (without its CRLF); extensions after `;` are
/// ignored.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let mut size: usize = 0;
    let mut digits = 0usize;
    for &byte in line {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte + 10 - b'a',
            b'A'..=b'F' => byte + 10 - b'A',
            b';' | b' ' | b'\t' => break,
            _ => return Err(Error::new_parse(Parse::Chunk)),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as usize))
            .ok_or_else(|| Error::new_parse(Parse::Chunk))?;
        digits += 1;
    }
    if digits == 0 {
        return Err(Error::new_parse(Parse::Chunk));
    }
    Ok(size)
}

/// Position just past the head's terminating blank line, if present.
pub(crate) fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_length_head() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
    }

    #[test]
    fn parses_chunked_head_and_server() {
        let head = parse_head(
            b"HTTP/1.1 200 OK\r\nServer: synapse/1.0\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
        assert_eq!(head.server.as_deref(), Some("synapse/1.0"));
    }

    #[test]
    fn rejects_unsupported_transfer_encoding() {
        let err =
            parse_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_head(b"NOT HTTP\r\n\r\n").is_err());
    }

    #[test]
    fn chunk_sizes() {
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"5").unwrap(), 5);
        assert_eq!(parse_chunk_size(b"ff").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"Ff").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"a;ext=1").unwrap(), 10);
        assert_eq!(parse_chunk_size(b"3   ").unwrap(), 3);
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"x").is_err());
        assert!(parse_chunk_size(b"-1").is_err());
        assert!(parse_chunk_size(b"fffffffffffffffff").is_err());
    }

    #[test]
    fn finds_head_end() {
        assert_eq!(head_end(b"HTTP/1.1 200 OK\r\n\r\nrest"), Some(19));
        assert_eq!(head_end(b"HTTP/1.1 200 OK\r\n"), None);
    }
}
