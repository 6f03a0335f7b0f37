//! User-visible request and response model.
//!
//! The caller composes the request head verbatim and hands over ownership
//! of the out-buffers at submission. The response body lands either in a
//! pre-sized contiguous buffer or in per-chunk buffers, depending on
//! whether `in_content` is provided.

use bytes::Bytes;
use http::StatusCode;

/// Called per partial write of the request content with the slice just
/// consumed and the cumulative content bytes written so far.
pub type Progress = Box<dyn FnMut(&[u8], usize)>;

pub struct Request {
    /// Complete request head, through the terminating blank line.
    pub head: Bytes,
    /// Request body.
    pub content: Bytes,
    /// Pre-sized response-content buffer (contiguous mode); `None` selects
    /// dynamic chunk mode for chunked responses.
    pub in_content: Option<Vec<u8>>,
    pub opt: RequestOpts,
    pub progress: Option<Progress>,
}

impl Request {
    pub fn new(head: impl Into<Bytes>) -> Request {
        Request {
            head: head.into(),
            content: Bytes::new(),
            in_content: None,
            opt: RequestOpts::default(),
            progress: None,
        }
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Request {
        self.content = content.into();
        self
    }

    /// Receive the response body into a caller-sized buffer.
    pub fn in_content(mut self, capacity: usize) -> Request {
        self.in_content = Some(vec![0u8; capacity]);
        self
    }

    pub fn opt(mut self, opt: RequestOpts) -> Request {
        self.opt = opt;
        self
    }
}

#[derive(Clone)]
pub struct RequestOpts {
    /// Deliver responses with status >= 300 as errors.
    pub http_exceptions: bool,
    /// Accept bodies larger than the in-buffer, discarding the excess,
    /// instead of failing the request.
    pub truncate_content: bool,
    /// In dynamic chunk mode, concatenate the chunks into one buffer at
    /// completion.
    pub contiguous_content: bool,
    /// Link selection priority. `i8::MIN` demands a dedicated link when
    /// the best candidate already has a committed tag.
    pub priority: i8,
    /// Response head buffer size; heads beyond it fail the request.
    pub head_max: usize,
}

impl Default for RequestOpts {
    fn default() -> RequestOpts {
        RequestOpts {
            http_exceptions: false,
            truncate_content: false,
            contiguous_content: false,
            priority: 0,
            head_max: 8192,
        }
    }
}

/// A completed response. `content` carries the contiguous body; `chunks`
/// carries the per-chunk buffers when dynamic mode did not concatenate.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Raw head bytes, through the terminating blank line.
    pub head: Bytes,
    pub content: Bytes,
    pub chunks: Vec<Bytes>,
}

impl Response {
    /// Linear scan for one header; parsing on demand keeps the hot path
    /// free of a header map.
    pub fn header(&self, name: &str) -> Option<String> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&self.head) {
            Ok(_) => parsed
                .headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .and_then(|header| std::str::from_utf8(header.value).ok())
                .map(|value| value.trim().to_owned()),
            Err(_) => None,
        }
    }

    /// The body, regardless of delivery mode.
    pub fn body(&self) -> Vec<u8> {
        if !self.content.is_empty() || self.chunks.is_empty() {
            self.content.to_vec()
        } else {
            let mut body = Vec::with_capacity(self.chunks.iter().map(Bytes::len).sum());
            for chunk in &self.chunks {
                body.extend_from_slice(chunk);
            }
            body
        }
    }
}
