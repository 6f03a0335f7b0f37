//! TCP sockets, optionally wrapped in TLS.
//!
//! Sockets are reference-counted and single-threaded; every blocking
//! operation is an interruption point and honors both its own deadline and
//! the socket's scope timer. The four read variants differ on
//! (blocking × completion): `read_all` fills the buffer, `read_few` yields
//! at least one byte, `read_any` drains without suspending, `read_one`
//! performs one transport attempt and reports `WouldBlock` as zero.

use std::cell::{Cell, RefCell};
use std::future::Future as StdFuture;
use std::io::{self, Read as IoRead, Write as IoWrite};
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::exec::runtime;
use crate::{Error, Result};

use super::opts::{CloseOpts, CloseType, OpenOpts, Ready, SockOpts, WaitOpts};
use super::reactor::Dir;
use super::tls;

static IDS: AtomicU64 = AtomicU64::new(0);

pub struct Socket {
    id: u64,
    io: RefCell<Option<TcpStream>>,
    key: Cell<Option<usize>>,
    session: RefCell<Option<rustls::Connection>>,
    scope_deadline: Cell<Option<Instant>>,
}

/// Open a connection per `opts`: non-blocking connect under
/// `connect_timeout`, then (unless disabled) a TLS handshake under
/// `handshake_timeout` with the options' certificate policy.
pub async fn connect(opts: &OpenOpts) -> Result<Rc<Socket>> {
    let stream = TcpStream::connect(opts.ipport).map_err(Error::new_connect)?;
    let sock = Socket::from_stream(stream)?;
    debug!("socket:{} connecting to {}", sock.id, opts.ipport);

    let result = connect_inner(&sock, opts).await;
    if let Err(err) = result {
        sock.close_now();
        return Err(err);
    }
    Ok(sock)
}

async fn connect_inner(sock: &Rc<Socket>, opts: &OpenOpts) -> Result<()> {
    let deadline = Instant::now() + opts.connect_timeout;
    sock.ready_until(Dir::Write, Some(deadline)).await?;
    if let Some(err) = sock.with_stream(|s| s.take_error())?? {
        return Err(Error::new_connect(err));
    }
    sock.apply_sopts(&opts.sopts)?;

    if opts.handshake {
        let config = tls::client_config(opts)?;
        let name = tls::server_name(opts)?;
        let conn =
            rustls::ClientConnection::new(config, name).map_err(Error::new_tls)?;
        sock.set_session(rustls::Connection::Client(conn));
        let deadline = Instant::now() + opts.handshake_timeout;
        sock.handshake(deadline).await?;
        trace!("socket:{} handshake complete", sock.id);
    }
    Ok(())
}

impl Socket {
    /// Wrap and register an already-connected (or connecting) stream.
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Rc<Socket>> {
        let sock = Rc::new(Socket {
            id: IDS.fetch_add(1, Ordering::Relaxed),
            io: RefCell::new(Some(stream)),
            key: Cell::new(None),
            session: RefCell::new(None),
            scope_deadline: Cell::new(None),
        });
        let key = runtime::with(|handle| {
            let mut io = sock.io.borrow_mut();
            handle.reactor.register(io.as_mut().unwrap())
        })?;
        sock.key.set(Some(key));
        Ok(sock)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.with_stream(|s| s.local_addr())??)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.with_stream(|s| s.peer_addr())??)
    }

    /// Whether the transport is still open (a disconnect has not completed).
    pub fn opened(&self) -> bool {
        self.io.borrow().is_some()
    }

    pub(crate) fn set_session(&self, session: rustls::Connection) {
        *self.session.borrow_mut() = Some(session);
    }

    pub(crate) fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Result<R> {
        let mut io = self.io.borrow_mut();
        match io.as_mut() {
            Some(stream) => Ok(f(stream)),
            None => Err(Error::new_io(io::ErrorKind::NotConnected.into())),
        }
    }

    fn apply_sopts(&self, sopts: &SockOpts) -> Result<()> {
        self.with_stream(|stream| -> io::Result<()> {
            if let Some(nodelay) = sopts.nodelay {
                stream.set_nodelay(nodelay)?;
            }
            let sock = socket2::SockRef::from(&*stream);
            if let Some(keepalive) = sopts.keepalive {
                sock.set_keepalive(keepalive)?;
            }
            if let Some(linger) = sopts.linger {
                sock.set_linger(Some(linger))?;
            }
            Ok(())
        })??;
        Ok(())
    }

    /// Arm the scope timer: while the guard lives, every suspension on this
    /// socket fails with `timed_out` once the deadline passes.
    pub fn scope_timeout(self: &Rc<Self>, timeout: Duration) -> ScopeTimeout {
        let prev = self.scope_deadline.replace(Some(Instant::now() + timeout));
        ScopeTimeout {
            sock: self.clone(),
            prev,
        }
    }

    /// Suspend until the requested readiness holds.
    ///
    /// A READ wait first consults plaintext already decrypted by the TLS
    /// layer; otherwise a readable socket whose bytes all sit in user-space
    /// TLS buffers would park forever.
    pub async fn wait(&self, opts: WaitOpts) -> Result<()> {
        let deadline = opts.timeout.map(|t| Instant::now() + t);
        match opts.ready {
            Ready::Read => self.ready_until(Dir::Read, deadline).await,
            Ready::Write => self.ready_until(Dir::Write, deadline).await,
            Ready::Error => {
                // resumes on any readiness; reports the probed state
                self.ready_until(Dir::Read, deadline).await?;
                self.check(Ready::Error)
            }
        }
    }

    /// Non-blocking readiness/error probe.
    pub fn check(&self, _ready: Ready) -> Result<()> {
        if let Some(err) = self.with_stream(|s| s.take_error())?? {
            return Err(Error::new_io(err));
        }
        Ok(())
    }

    // ===== read =====

    /// Suspend until `buf` is full or EOF; errors on EOF with zero
    /// progress, otherwise returns bytes read.
    pub async fn read_all(&self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.read_step(&mut buf[total..]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(eof());
                    }
                    break;
                }
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Read);
                    self.ready_until(Dir::Read, None).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        Ok(total)
    }

    /// Suspend until at least one byte arrives.
    pub async fn read_few(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.read_any(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.ready_until(Dir::Read, None).await?;
        }
    }

    /// Drain whatever is available without suspending; zero is a valid
    /// return when nothing is buffered.
    pub fn read_any(&self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.read_step(&mut buf[total..]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(eof());
                    }
                    break;
                }
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Read);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        Ok(total)
    }

    /// One transport attempt; never suspends, `WouldBlock` reads as zero.
    pub fn read_one(&self, buf: &mut [u8]) -> Result<usize> {
        match self.read_step(buf) {
            Ok(0) => Err(eof()),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.clear(Dir::Read);
                Ok(0)
            }
            Err(err) => Err(Error::new_io(err)),
        }
    }

    // ===== write =====

    /// Suspend until all of `buf` is written.
    pub async fn write_all(&self, buf: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.write_step(&buf[total..]) {
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Write);
                    self.ready_until(Dir::Write, None).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        Ok(total)
    }

    /// Suspend until at least one byte is accepted.
    pub async fn write_few(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let n = self.write_any(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.ready_until(Dir::Write, None).await?;
        }
    }

    /// Write as much as the transport accepts without suspending.
    pub fn write_any(&self, buf: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.write_step(&buf[total..]) {
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Write);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        Ok(total)
    }

    /// One transport attempt; never suspends, `WouldBlock` writes as zero.
    pub fn write_one(&self, buf: &[u8]) -> Result<usize> {
        match self.write_step(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.clear(Dir::Write);
                Ok(0)
            }
            Err(err) => Err(Error::new_io(err)),
        }
    }

    // ===== close =====

    /// Orderly (or not) close. The socket is unusable afterwards regardless
    /// of the reported result.
    pub async fn disconnect(&self, opts: CloseOpts) -> Result<()> {
        debug!("socket:{} disconnect {:?}", self.id, opts.r#type);
        let result = match opts.r#type {
            CloseType::Rst => self.with_stream(|stream| {
                socket2::SockRef::from(&*stream).set_linger(Some(Duration::ZERO))
            })?.map_err(Error::new_io),
            CloseType::Fin => self
                .with_stream(|s| s.shutdown(std::net::Shutdown::Both))?
                .or_else(ignore_not_connected)
                .map_err(Error::new_io),
            CloseType::FinSend => self
                .with_stream(|s| s.shutdown(std::net::Shutdown::Write))?
                .or_else(ignore_not_connected)
                .map_err(Error::new_io),
            CloseType::FinRecv => self
                .with_stream(|s| s.shutdown(std::net::Shutdown::Read))?
                .or_else(ignore_not_connected)
                .map_err(Error::new_io),
            CloseType::SslNotify => self.ssl_notify(opts.timeout).await,
        };
        self.close_now();
        result
    }

    /// close_notify, flush, then drain until the peer's EOF. EOF and a
    /// reset both count as a completed close; only the timeout is reported.
    async fn ssl_notify(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        {
            let mut session = self.session.borrow_mut();
            match session.as_mut() {
                Some(conn) => conn.send_close_notify(),
                None => return self
                    .with_stream(|s| s.shutdown(std::net::Shutdown::Both))?
                    .or_else(ignore_not_connected)
                    .map_err(Error::new_io),
            }
        }
        loop {
            match self.tls_flush() {
                Ok(true) => break,
                Ok(false) => self.ready_until(Dir::Write, Some(deadline)).await?,
                Err(err) if reset_is_closed(&err) => return Ok(()),
                Err(err) => return Err(Error::new_io(err)),
            }
        }
        let mut scratch = [0u8; 512];
        loop {
            match self.read_step(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Read);
                    self.ready_until(Dir::Read, Some(deadline)).await?;
                }
                Err(err) if reset_is_closed(&err) => return Ok(()),
                Err(err) => return Err(Error::new_io(err)),
            }
        }
    }

    pub(crate) fn close_now(&self) {
        if let Some(key) = self.key.take() {
            if let Some(mut stream) = self.io.borrow_mut().take() {
                runtime::try_with(|handle| {
                    let _ = handle.reactor.deregister(&mut stream, key);
                });
            }
        }
        self.session.borrow_mut().take();
    }

    // ===== internals =====

    /// One non-blocking read attempt, through TLS when present. `Ok(0)` is
    /// EOF (a close_notify or a bare FIN both count), `WouldBlock` means no
    /// bytes are available.
    fn read_step(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.session.borrow().is_none() {
            return self.plain_io(|stream| stream.read(buf));
        }
        loop {
            {
                let mut session = self.session.borrow_mut();
                let conn = session.as_mut().unwrap();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(err) => return Err(err),
                }
            }
            match self.tls_read_io()? {
                0 => return Ok(0),
                _ => continue,
            }
        }
    }

    /// One non-blocking write attempt, through TLS when present.
    fn write_step(&self, buf: &[u8]) -> io::Result<usize> {
        if self.session.borrow().is_none() {
            return self.plain_io(|stream| stream.write(buf));
        }
        // refuse new plaintext while ciphertext is backed up
        if !self.tls_flush()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = {
            let mut session = self.session.borrow_mut();
            session.as_mut().unwrap().writer().write(buf)?
        };
        self.tls_flush()?;
        Ok(n)
    }

    fn plain_io<R>(&self, f: impl FnOnce(&mut TcpStream) -> io::Result<R>) -> io::Result<R> {
        let mut io = self.io.borrow_mut();
        match io.as_mut() {
            Some(stream) => f(stream),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Pull ciphertext off the wire into the session. `Ok(0)` is transport
    /// EOF; rustls-level failures surface as `InvalidData`.
    fn tls_read_io(&self) -> io::Result<usize> {
        let mut session = self.session.borrow_mut();
        let conn = session.as_mut().expect("tls_read_io without session");
        let mut io = self.io.borrow_mut();
        let stream = io
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let n = conn.read_tls(stream)?;
        if n > 0 {
            conn.process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        }
        Ok(n)
    }

    /// Push buffered ciphertext; `Ok(true)` when nothing remains.
    fn tls_flush(&self) -> io::Result<bool> {
        let mut session = self.session.borrow_mut();
        let Some(conn) = session.as_mut() else {
            return Ok(true);
        };
        let mut io = self.io.borrow_mut();
        let stream = io
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        while conn.wants_write() {
            match conn.write_tls(stream) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Plaintext sitting decrypted in the session, ready without a syscall.
    fn tls_buffered(&self) -> bool {
        let mut session = self.session.borrow_mut();
        match session.as_mut() {
            Some(conn) => conn
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .unwrap_or(true),
            None => false,
        }
    }

    /// Drive the TLS handshake to completion under `deadline`.
    pub(crate) async fn handshake(&self, deadline: Instant) -> Result<()> {
        loop {
            loop {
                match self.tls_flush() {
                    Ok(true) => break,
                    Ok(false) => self.ready_until(Dir::Write, Some(deadline)).await?,
                    Err(err) => return Err(map_handshake_err(err)),
                }
            }
            let handshaking = {
                let session = self.session.borrow();
                session.as_ref().map(|c| c.is_handshaking()).unwrap_or(false)
            };
            if !handshaking {
                return Ok(());
            }
            self.ready_until(Dir::Read, Some(deadline)).await?;
            match self.tls_read_io() {
                Ok(0) => {
                    return Err(Error::new_tls("peer closed during handshake"));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.clear(Dir::Read);
                }
                Err(err) => return Err(map_handshake_err(err)),
            }
        }
    }

    fn clear(&self, dir: Dir) {
        if let Some(key) = self.key.get() {
            runtime::try_with(|handle| handle.reactor.clear_ready(key, dir));
        }
    }

    pub(crate) fn ready_until(&self, dir: Dir, deadline: Option<Instant>) -> ReadyWait<'_> {
        let deadline = match (deadline, self.scope_deadline.get()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ReadyWait {
            sock: self,
            dir,
            deadline,
            timer: None,
            done: false,
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.io.borrow().is_some() {
            warn!("socket:{} dropped without disconnect", self.id);
            self.close_now();
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("opened", &self.opened())
            .field("tls", &self.session.borrow().is_some())
            .finish()
    }
}

fn eof() -> Error {
    Error::new_io(io::ErrorKind::UnexpectedEof.into())
}

fn ignore_not_connected(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotConnected {
        Ok(())
    } else {
        Err(err)
    }
}

fn reset_is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

fn map_handshake_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::InvalidData {
        Error::new_tls(err)
    } else {
        Error::new_io(err)
    }
}

/// Guard arming the socket's scope deadline; restores the previous one.
pub struct ScopeTimeout {
    sock: Rc<Socket>,
    prev: Option<Instant>,
}

impl Drop for ScopeTimeout {
    fn drop(&mut self) {
        self.sock.scope_deadline.set(self.prev);
    }
}

/// Readiness wait honoring interruption, an optional deadline and the
/// socket's scope timer.
pub(crate) struct ReadyWait<'a> {
    sock: &'a Socket,
    dir: Dir,
    deadline: Option<Instant>,
    timer: Option<crate::exec::TimerKey>,
    done: bool,
}

impl StdFuture for ReadyWait<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(err) = crate::exec::check_interrupt() {
            self.finish();
            return Poll::Ready(Err(err));
        }
        if self.dir == Dir::Read && self.sock.tls_buffered() {
            self.finish();
            return Poll::Ready(Ok(()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.finish();
                return Poll::Ready(Err(Error::new_timeout()));
            }
        }
        let Some(key) = self.sock.key.get() else {
            self.finish();
            return Poll::Ready(Err(Error::new_io(io::ErrorKind::NotConnected.into())));
        };
        let poll = runtime::with(|handle| handle.reactor.poll_ready(key, self.dir, cx));
        match poll {
            Poll::Ready(Ok(())) => {
                self.finish();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                self.finish();
                Poll::Ready(Err(Error::new_io(err)))
            }
            Poll::Pending => {
                if let Some(deadline) = self.deadline {
                    match &self.timer {
                        Some(k) => runtime::with(|h| h.timers.update_waker(k, cx.waker())),
                        None => {
                            let k = runtime::with(|h| {
                                h.timers.register(deadline, cx.waker().clone())
                            });
                            self.timer = Some(k);
                        }
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl ReadyWait<'_> {
    fn finish(&mut self) {
        self.done = true;
        if let Some(key) = self.timer.take() {
            runtime::try_with(|handle| handle.timers.cancel(key));
        }
    }
}

impl Drop for ReadyWait<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.finish();
        }
    }
}
