//! One in-flight request/response on a link.
//!
//! The tag owns the out-buffers handed over at submission and decides,
//! from its own state, which buffer each read lands in: the head buffer
//! until the head parses, the content buffer for fixed-length and chunk
//! bodies, the head buffer's tail as chunk-size-line scratch, and a small
//! discard buffer once nothing useful remains. Bytes past the end of this
//! tag's response are returned as overrun for the next tag in the
//! pipeline.

use bytes::Bytes;
use http::StatusCode;
use tracing::trace;

use crate::client::parse;
use crate::client::request::{Progress, Request, RequestOpts, Response};
use crate::error::Parse;
use crate::exec::{promise, Future, Promise};
use crate::{Error, Result};

const DISCARD_MAX: usize = 512;

pub(crate) struct Tag {
    pub(crate) id: u64,

    // out
    out_head: Bytes,
    out_content: Bytes,
    pub(crate) written: usize,
    progress: Option<Progress>,

    // response head, whose tail doubles as chunk-line scratch
    head_buf: Vec<u8>,
    head_read: usize,
    head_len: usize,
    line_len: usize,

    // parsed state
    pub(crate) status: u16,
    server: Option<String>,
    chunked: bool,
    content_length: usize,
    content_read: usize,
    chunk_length: usize,
    chunk_read: usize,
    expect_body_crlf: bool,
    final_seen: bool,
    epilogue_done: bool,

    // in
    content: ContentIn,
    chunks: Vec<Vec<u8>>,
    discard: Vec<u8>,

    opts: RequestOpts,
    promise: Option<Promise<Response>>,
    pub(crate) done: bool,
    pub(crate) canceled: bool,
    /// Times this tag has been moved to another link after a link died.
    pub(crate) resubmits: u8,
}

enum ContentIn {
    /// Caller-sized (or head-parse-sized) contiguous buffer.
    User(Vec<u8>),
    /// Per-chunk buffers, allocated as chunk headers arrive.
    Dynamic,
    /// Nothing useful to keep; count the bytes and drop them.
    Discard,
}

/// Outcome of feeding bytes to the tag.
pub(crate) struct Sift {
    /// Bytes belonging to the next response in the pipeline.
    pub(crate) overrun: Vec<u8>,
    /// The response is fully received.
    pub(crate) done: bool,
}

impl Sift {
    fn pending() -> Sift {
        Sift {
            overrun: Vec::new(),
            done: false,
        }
    }
}

enum Buf {
    Head,
    Line,
    User { start: usize, end: usize },
    Chunk,
    Discard { len: usize },
}

impl Tag {
    pub(crate) fn new(request: Request, id: u64) -> (Tag, Future<Response>) {
        let (promise, future) = promise();
        let content = match request.in_content {
            Some(buf) => ContentIn::User(buf),
            None => ContentIn::Dynamic,
        };
        let tag = Tag {
            id,
            out_head: request.head,
            out_content: request.content,
            written: 0,
            progress: request.progress,
            head_buf: vec![0u8; request.opt.head_max],
            head_read: 0,
            head_len: 0,
            line_len: 0,
            status: 0,
            server: None,
            chunked: false,
            content_length: 0,
            content_read: 0,
            chunk_length: usize::MAX,
            chunk_read: 0,
            expect_body_crlf: false,
            final_seen: false,
            epilogue_done: false,
            content,
            chunks: Vec::new(),
            discard: Vec::new(),
            opts: request.opt,
            promise: Some(promise),
            done: false,
            canceled: false,
            resubmits: 0,
        };
        (tag, future)
    }

    pub(crate) fn priority(&self) -> i8 {
        self.opts.priority
    }

    // ===== out side =====

    pub(crate) fn committed(&self) -> bool {
        self.written > 0
    }

    pub(crate) fn out_len(&self) -> usize {
        self.out_head.len() + self.out_content.len()
    }

    pub(crate) fn write_remaining(&self) -> usize {
        self.out_len() - self.written
    }

    pub(crate) fn read_remaining(&self) -> usize {
        if self.status == 0 {
            0
        } else {
            self.content_length.saturating_sub(self.content_read)
        }
    }

    /// The next slice of request bytes to put on the wire.
    pub(crate) fn write_view(&self) -> Bytes {
        let head_len = self.out_head.len();
        if self.written < head_len {
            self.out_head.slice(self.written..)
        } else {
            self.out_content.slice(self.written - head_len..)
        }
    }

    /// Account for `n` bytes written; fires the progress callback for the
    /// content region.
    pub(crate) fn advance_written(&mut self, n: usize) {
        let head_len = self.out_head.len();
        let start = self.written;
        self.written += n;
        debug_assert!(self.written <= self.out_len());
        if let Some(callback) = &mut self.progress {
            if self.written > head_len {
                let from = start.max(head_len) - head_len;
                let to = self.written - head_len;
                if to > from {
                    let slice = self.out_content.slice(from..to);
                    callback(&slice, to);
                }
            }
        }
    }

    // ===== in side =====

    /// The buffer the next read should land in. Errors when the state
    /// machine has no room left to make progress (head or chunk line
    /// overflow).
    pub(crate) fn read_buffer(&mut self) -> Result<&mut [u8]> {
        match self.choose() {
            Buf::Head => {
                if self.head_read >= self.head_buf.len() {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                Ok(&mut self.head_buf[self.head_read..])
            }
            Buf::Line => {
                let at = self.head_len + self.line_len;
                if at >= self.head_buf.len() {
                    return Err(Error::new_parse(Parse::Chunk).with("chunk line overflow"));
                }
                Ok(&mut self.head_buf[at..])
            }
            Buf::User { start, end } => {
                let ContentIn::User(buf) = &mut self.content else {
                    unreachable!()
                };
                Ok(&mut buf[start..end])
            }
            Buf::Chunk => {
                let chunk = self.chunks.last_mut().expect("chunk body without buffer");
                let at = self.chunk_read;
                Ok(&mut chunk[at..])
            }
            Buf::Discard { len } => {
                if self.discard.is_empty() {
                    self.discard = vec![0u8; DISCARD_MAX];
                }
                Ok(&mut self.discard[..len])
            }
        }
    }

    /// Account for `n` bytes read into the buffer [`read_buffer`] handed
    /// out, advancing the state machine.
    ///
    /// [`read_buffer`]: Tag::read_buffer
    pub(crate) fn consume(&mut self, n: usize) -> Result<Sift> {
        match self.choose() {
            Buf::Head => {
                self.head_read += n;
                if let Some(end) = parse::head_end(&self.head_buf[..self.head_read]) {
                    let extra = self.head_buf[end..self.head_read].to_vec();
                    self.parse_head_at(end)?;
                    self.head_read = end;
                    return self.sift(&extra);
                }
                if self.head_read >= self.head_buf.len() {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                Ok(Sift::pending())
            }
            Buf::Line => {
                // pull the new bytes back out of the scratch and run them
                // through the line machine
                let start = self.head_len + self.line_len;
                let new = self.head_buf[start..start + n].to_vec();
                self.sift(&new)
            }
            _ => {
                self.advance_body(n);
                Ok(Sift {
                    overrun: Vec::new(),
                    done: self.finished_body(),
                })
            }
        }
    }

    /// Feed bytes that did not arrive via [`read_buffer`]: head leftovers
    /// and a predecessor tag's overrun.
    ///
    /// [`read_buffer`]: Tag::read_buffer
    pub(crate) fn sift(&mut self, data: &[u8]) -> Result<Sift> {
        let mut data = data;
        while !data.is_empty() && !self.finished_body() {
            match self.choose() {
                Buf::Head => {
                    let space = self.head_buf.len() - self.head_read;
                    if space == 0 {
                        return Err(Error::new_parse(Parse::TooLarge));
                    }
                    let n = space.min(data.len());
                    self.head_buf[self.head_read..self.head_read + n]
                        .copy_from_slice(&data[..n]);
                    self.head_read += n;
                    data = &data[n..];
                    if let Some(end) = parse::head_end(&self.head_buf[..self.head_read]) {
                        let mut rest = self.head_buf[end..self.head_read].to_vec();
                        rest.extend_from_slice(data);
                        self.parse_head_at(end)?;
                        self.head_read = end;
                        return self.sift(&rest);
                    }
                    if self.head_read >= self.head_buf.len() {
                        return Err(Error::new_parse(Parse::TooLarge));
                    }
                }
                Buf::Line => {
                    let cap = self.head_buf.len();
                    let mut idx = 0;
                    let mut complete = false;
                    while idx < data.len() {
                        let at = self.head_len + self.line_len;
                        if at >= cap {
                            return Err(
                                Error::new_parse(Parse::Chunk).with("chunk line overflow")
                            );
                        }
                        let byte = data[idx];
                        self.head_buf[at] = byte;
                        self.line_len += 1;
                        idx += 1;
                        if byte == b'\n' {
                            complete = true;
                            break;
                        }
                    }
                    data = &data[idx..];
                    if complete {
                        let region = &self.head_buf
                            [self.head_len..self.head_len + self.line_len];
                        if region.len() < 2 || region[region.len() - 2] != b'\r' {
                            return Err(Error::new_parse(Parse::Chunk));
                        }
                        let line = region[..region.len() - 2].to_vec();
                        self.line_len = 0;
                        self.line_done(&line)?;
                    }
                }
                Buf::User { start, end } => {
                    let n = (end - start).min(data.len());
                    let ContentIn::User(buf) = &mut self.content else {
                        unreachable!()
                    };
                    buf[start..start + n].copy_from_slice(&data[..n]);
                    self.advance_body(n);
                    data = &data[n..];
                }
                Buf::Chunk => {
                    let at = self.chunk_read;
                    let chunk = self.chunks.last_mut().expect("chunk body without buffer");
                    let n = (chunk.len() - at).min(data.len());
                    chunk[at..at + n].copy_from_slice(&data[..n]);
                    self.advance_body(n);
                    data = &data[n..];
                }
                Buf::Discard { len } => {
                    let n = len.min(data.len());
                    self.advance_body(n);
                    data = &data[n..];
                }
            }
        }
        Ok(Sift {
            overrun: data.to_vec(),
            done: self.finished_body(),
        })
    }

    fn choose(&self) -> Buf {
        debug_assert!(!self.done);
        if self.status == 0 {
            return Buf::Head;
        }
        if self.chunked && self.chunk_length == usize::MAX {
            return Buf::Line;
        }
        let remaining = if self.chunked {
            self.chunk_length - self.chunk_read
        } else {
            self.content_length - self.content_read
        };
        match &self.content {
            ContentIn::Dynamic => Buf::Chunk,
            ContentIn::User(buf) => {
                let start = self.content_read;
                if start >= buf.len() {
                    Buf::Discard {
                        len: remaining.clamp(1, DISCARD_MAX),
                    }
                } else {
                    Buf::User {
                        start,
                        end: start + remaining.min(buf.len() - start),
                    }
                }
            }
            ContentIn::Discard => Buf::Discard {
                len: remaining.clamp(1, DISCARD_MAX),
            },
        }
    }

    fn advance_body(&mut self, n: usize) {
        self.content_read += n;
        if self.chunked {
            self.chunk_read += n;
            debug_assert!(self.chunk_read <= self.chunk_length);
            if self.chunk_read == self.chunk_length {
                self.chunk_length = usize::MAX;
                self.chunk_read = 0;
                self.expect_body_crlf = true;
            }
        }
    }

    fn finished_body(&self) -> bool {
        if self.status == 0 {
            return false;
        }
        if self.chunked {
            self.epilogue_done
        } else {
            self.content_read >= self.content_length
        }
    }

    fn parse_head_at(&mut self, end: usize) -> Result<()> {
        let head = parse::parse_head(&self.head_buf[..end])?;
        trace!(
            "tag:{} head parsed: status={} length={:?} chunked={}",
            self.id,
            head.status,
            head.content_length,
            head.chunked
        );
        self.status = head.status;
        self.server = head.server;
        self.head_len = end;
        if head.chunked {
            self.chunked = true;
            self.content_length = 0;
            self.chunk_length = usize::MAX;
        } else {
            self.content_length = head.content_length.unwrap_or(0);
            match &mut self.content {
                ContentIn::User(buf) => {
                    if self.content_length > buf.len()
                        && !self.opts.truncate_content
                        && !self.canceled
                    {
                        return Err(Error::new_parse(Parse::ContentLength));
                    }
                }
                ContentIn::Dynamic => {
                    // fixed-length with no caller buffer: allocate exactly
                    self.content = ContentIn::User(vec![0u8; self.content_length]);
                }
                ContentIn::Discard => {}
            }
        }
        Ok(())
    }

    fn line_done(&mut self, line: &[u8]) -> Result<()> {
        if self.expect_body_crlf {
            if !line.is_empty() {
                return Err(Error::new_parse(Parse::Chunk).with("missing chunk body CRLF"));
            }
            self.expect_body_crlf = false;
            return Ok(());
        }
        if self.final_seen {
            // trailers are read and dropped; the empty line ends the message
            if line.is_empty() {
                self.epilogue_done = true;
            }
            return Ok(());
        }
        let size = parse::parse_chunk_size(line)?;
        if size == 0 {
            self.final_seen = true;
            return Ok(());
        }
        self.content_length += size;
        match &mut self.content {
            ContentIn::User(buf) => {
                if self.content_length > buf.len()
                    && !self.opts.truncate_content
                    && !self.canceled
                {
                    return Err(Error::new_parse(Parse::ContentLength));
                }
            }
            ContentIn::Dynamic => self.chunks.push(vec![0u8; size]),
            ContentIn::Discard => {}
        }
        self.chunk_length = size;
        self.chunk_read = 0;
        Ok(())
    }

    // ===== completion =====

    /// Fulfill the future and seal the tag. Returns the status and the
    /// captured `Server:` value for the peer.
    pub(crate) fn complete(&mut self) -> (u16, Option<String>) {
        self.done = true;
        let status = self.status;
        let server = self.server.take();
        let promise = self.promise.take();
        if self.canceled {
            trace!("tag:{} canceled response discarded", self.id);
            return (status, server);
        }
        let Some(promise) = promise else {
            return (status, server);
        };
        if self.opts.http_exceptions && status >= 300 {
            let _ = promise.set_error(Error::new_status(status));
            return (status, server);
        }
        let head = Bytes::copy_from_slice(&self.head_buf[..self.head_len]);
        let (content, chunks) = match std::mem::replace(&mut self.content, ContentIn::Discard) {
            ContentIn::User(mut buf) => {
                let delivered = self.content_read.min(buf.len());
                buf.truncate(delivered);
                (Bytes::from(buf), Vec::new())
            }
            ContentIn::Dynamic => {
                let raw = std::mem::take(&mut self.chunks);
                if self.opts.contiguous_content {
                    let total = raw.iter().map(Vec::len).sum();
                    let mut joined = Vec::with_capacity(total);
                    for chunk in &raw {
                        joined.extend_from_slice(chunk);
                    }
                    (Bytes::from(joined), Vec::new())
                } else {
                    (Bytes::new(), raw.into_iter().map(Bytes::from).collect())
                }
            }
            ContentIn::Discard => (Bytes::new(), Vec::new()),
        };
        let status_code =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let _ = promise.set_value(Response {
            status: status_code,
            head,
            content,
            chunks,
        });
        (status, server)
    }

    /// Fail the future; the tag is finished.
    pub(crate) fn fail(&mut self, err: Error) {
        self.done = true;
        if let Some(promise) = self.promise.take() {
            let _ = promise.set_error(err);
        }
    }

    /// User-side cancellation. The future fails now; a committed tag keeps
    /// draining with its in-buffers swapped for the discard sink, so the
    /// pipeline stays coherent while the bulk allocations are released.
    pub(crate) fn cancel(&mut self) {
        if let Some(promise) = self.promise.take() {
            let _ = promise.set_error(Error::new_canceled());
        }
        self.canceled = true;
        self.content = ContentIn::Discard;
        self.chunks = Vec::new();
        self.progress = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(request: Request) -> (Tag, Future<Response>) {
        Tag::new(request, 1)
    }

    fn feed(tag: &mut Tag, bytes: &[u8]) -> Sift {
        tag.sift(bytes).expect("sift failed")
    }

    #[test]
    fn write_view_walks_head_then_content() {
        let (mut t, _f) = tag(Request::new("HEAD").content("BODY"));
        assert_eq!(&t.write_view()[..], b"HEAD");
        t.advance_written(2);
        assert_eq!(&t.write_view()[..], b"AD");
        t.advance_written(2);
        assert_eq!(&t.write_view()[..], b"BODY");
        t.advance_written(4);
        assert_eq!(t.write_remaining(), 0);
        assert!(t.committed());
    }

    #[test]
    fn progress_reports_content_only() {
        let seen: std::rc::Rc<std::cell::RefCell<Vec<(Vec<u8>, usize)>>> = Default::default();
        let record = seen.clone();
        let mut request = Request::new("HD").content("abcdef");
        request.progress = Some(Box::new(move |slice, total| {
            record.borrow_mut().push((slice.to_vec(), total));
        }));
        let (mut t, _f) = tag(request);
        t.advance_written(4); // "HD" + "ab"
        t.advance_written(4); // "cdef"
        let seen = seen.borrow();
        assert_eq!(seen[0], (b"ab".to_vec(), 2));
        assert_eq!(seen[1], (b"cdef".to_vec(), 6));
    }

    #[test]
    fn fixed_length_response() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(sift.done);
        assert!(sift.overrun.is_empty());
        assert_eq!(t.status, 200);
        assert_eq!(t.content_length, 5);
        assert_eq!(t.content_read, 5);
    }

    #[test]
    fn overrun_belongs_to_next_tag() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokHTTP/1.1 404",
        );
        assert!(sift.done);
        assert_eq!(sift.overrun, b"HTTP/1.1 404".to_vec());
    }

    #[test]
    fn chunked_contiguous_strips_separators() {
        let request = Request::new("GET / HTTP/1.1\r\n\r\n").in_content(11);
        let (mut t, _f) = tag(request);
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert!(sift.done);
        assert_eq!(t.content_length, 11);
        assert_eq!(t.content_read, 11);
        let (status, _) = t.complete();
        assert_eq!(status, 200);
    }

    #[test]
    fn chunked_dynamic_allocates_per_chunk() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert!(sift.done);
        assert_eq!(t.chunks.len(), 2);
        assert_eq!(t.chunks[0], b"hello");
        assert_eq!(t.chunks[1], b" world");
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let response: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let mut done = false;
        for &byte in response {
            let sift = feed(&mut t, &[byte]);
            if sift.done {
                done = true;
            }
        }
        assert!(done);
        assert_eq!(t.chunks.concat(), b"foobar");
    }

    #[test]
    fn chunked_with_trailers_ignored() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\nX-Trailer: 1\r\n\r\nnext",
        );
        assert!(sift.done);
        assert_eq!(sift.overrun, b"next".to_vec());
    }

    #[test]
    fn content_length_exceeds_buffer_without_truncate() {
        let request = Request::new("GET / HTTP/1.1\r\n\r\n").in_content(3);
        let (mut t, _f) = tag(request);
        let err = t
            .sift(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
            .unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn content_length_truncates_when_asked() {
        let mut opts = RequestOpts::default();
        opts.truncate_content = true;
        let request = Request::new("GET / HTTP/1.1\r\n\r\n").in_content(3).opt(opts);
        let (mut t, _f) = tag(request);
        let sift = feed(&mut t, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789");
        assert!(sift.done);
        assert_eq!(t.content_read, 10);
    }

    #[test]
    fn canceled_tag_keeps_draining() {
        let request = Request::new("GET / HTTP/1.1\r\n\r\n").in_content(1024);
        let (mut t, _f) = tag(request);
        t.advance_written(5); // committed
        t.cancel();
        assert!(t.canceled);
        let sift = feed(
            &mut t,
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbodyHTTP/1.1 200",
        );
        assert!(sift.done);
        assert_eq!(sift.overrun, b"HTTP/1.1 200".to_vec());
    }

    #[test]
    fn zero_length_body_completes_at_head() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let sift = feed(&mut t, b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n");
        assert!(sift.done);
        assert_eq!(t.status, 502);
    }

    #[test]
    fn bad_chunk_crlf_is_rejected() {
        let (mut t, _f) = tag(Request::new("GET / HTTP/1.1\r\n\r\n"));
        let err = t
            .sift(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhiXX")
            .unwrap_err();
        assert!(err.is_parse());
    }
}
