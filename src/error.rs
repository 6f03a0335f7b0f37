//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have fedlink `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur in the execution engine, the network
/// layer, or the request pipeline.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    /// A suspension point resumed because the task was interrupted.
    Interrupted,
    /// A timed wait expired, or a timer attached to a socket fired.
    Timeout,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// TLS handshake failure, certificate rejection, or SNI mismatch.
    Tls,
    /// Error occurred while connecting.
    Connect,
    /// A DNS reply was malformed, or a query failed.
    Dns(Dns),
    /// HTTP response head or body framing error.
    Parse(Parse),
    /// A pending item was dropped before ever being processed, or the user
    /// abandoned the request.
    Canceled,
    /// The peer has a latched error and is inside its cool-down window.
    Unavailable,
    /// The remote answered with a status the request options classify as an
    /// error (`http_exceptions`).
    Status(u16),
    /// The last promise was dropped without a value being set.
    BrokenPromise,
    /// `Future::get` was called a second time.
    FutureAlreadyRetrieved,
    /// A promise's value was set twice.
    PromiseAlreadySatisfied,
    /// Error creating or accepting on a listener.
    Accept,
    /// Message reached EOF, but is not complete.
    IncompleteMessage,
}

#[derive(Debug, Clone)]
pub(crate) enum Parse {
    Head,
    Status,
    TooLarge,
    Chunk,
    ContentLength,
}

#[derive(Debug, Clone)]
pub(crate) enum Dns {
    Malformed,
    NxDomain,
    TimedOut,
    Refused(u8),
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Same kind, stringified cause. Fans one failure out to every tag on a
    /// dying link without requiring causes to be cloneable.
    pub(crate) fn replicate(&self) -> Error {
        let mut copy = Error::new(self.inner.kind.clone());
        if let Some(cause) = &self.inner.cause {
            copy = copy.with(cause.to_string());
        }
        copy
    }

    /// Returns true if the task owning the operation was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self.inner.kind, Kind::Interrupted)
    }

    /// Returns true if a timed wait or socket timer expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if this was caused by an `io::Error` on a stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Transport EOF (`UnexpectedEof` carried by an `Io` error).
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
            && self
                .inner
                .cause
                .as_ref()
                .and_then(|cause| cause.downcast_ref::<std::io::Error>())
                .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
                .unwrap_or(false)
    }

    /// Returns true for TLS handshake and certificate failures.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if this error occurred while connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true for resolver errors, including NXDOMAIN when the caller
    /// asked for it to be an error.
    pub fn is_dns(&self) -> bool {
        matches!(self.inner.kind, Kind::Dns(_))
    }

    /// Returns true specifically for NXDOMAIN.
    pub fn is_nxdomain(&self) -> bool {
        matches!(self.inner.kind, Kind::Dns(Dns::NxDomain))
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the request or item was canceled before completion.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the peer refused the submission from inside its error
    /// cool-down window.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.inner.kind, Kind::Unavailable)
    }

    /// Returns true if the last promise was dropped without a value.
    pub fn is_broken_promise(&self) -> bool {
        matches!(self.inner.kind, Kind::BrokenPromise)
    }

    /// The HTTP status carried by a `Status` error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    pub(crate) fn new_interrupted() -> Error {
        Error::new(Kind::Interrupted)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_tls<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_dns(dns: Dns) -> Error {
        Error::new(Kind::Dns(dns))
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_canceled_with<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Canceled).with(cause)
    }

    pub(crate) fn new_unavailable<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Unavailable).with(cause)
    }

    pub(crate) fn new_status(code: u16) -> Error {
        Error::new(Kind::Status(code))
    }

    pub(crate) fn new_broken_promise() -> Error {
        Error::new(Kind::BrokenPromise)
    }

    pub(crate) fn new_future_already_retrieved() -> Error {
        Error::new(Kind::FutureAlreadyRetrieved)
    }

    pub(crate) fn new_promise_already_satisfied() -> Error {
        Error::new(Kind::PromiseAlreadySatisfied)
    }

    pub(crate) fn new_accept<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Interrupted => "task interrupted",
            Kind::Timeout => "operation timed out",
            Kind::Io => "socket error",
            Kind::Tls => "TLS failure",
            Kind::Connect => "error trying to connect",
            Kind::Dns(Dns::Malformed) => "malformed DNS reply",
            Kind::Dns(Dns::NxDomain) => "host not found",
            Kind::Dns(Dns::TimedOut) => "DNS query timed out after retries",
            Kind::Dns(Dns::Refused(_)) => "DNS server refused the query",
            Kind::Parse(Parse::Head) => "invalid response head",
            Kind::Parse(Parse::Status) => "invalid status line",
            Kind::Parse(Parse::TooLarge) => "response head too large",
            Kind::Parse(Parse::Chunk) => "invalid chunked encoding",
            Kind::Parse(Parse::ContentLength) => "content length exceeds buffer",
            Kind::Canceled => "request canceled",
            Kind::Unavailable => "peer is in error cool-down",
            Kind::Status(_) => "erroneous HTTP status",
            Kind::BrokenPromise => "promise dropped without a value",
            Kind::FutureAlreadyRetrieved => "future value already retrieved",
            Kind::PromiseAlreadySatisfied => "promise value already set",
            Kind::Accept => "error accepting connection",
            Kind::IncompleteMessage => "connection closed before message completed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("fedlink::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn kind_predicates() {
        assert!(Error::new_timeout().is_timeout());
        assert!(Error::new_interrupted().is_interrupted());
        assert!(Error::new_canceled().is_canceled());
        assert!(Error::new_broken_promise().is_broken_promise());
        assert_eq!(Error::new_status(502).status(), Some(502));
    }
}
