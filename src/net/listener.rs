//! TLS-terminating listener with SNI dispatch and ALPN negotiation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future as StdFuture;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use rustls::server::Acceptor as TlsAcceptor;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::exec::{self, runtime, Dock, SpawnOpts, TaskHandle};
use crate::{Error, Result};

use super::reactor::Dir;
use super::socket::Socket;
use super::tls;

/// Protocol versions an acceptor refuses. SSLv2/SSLv3/TLSv1.0/TLSv1.1 are
/// never offered by the TLS backend; their flags exist so an embedding
/// server's option bag round-trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct SslDisable {
    pub sslv2: bool,
    pub sslv3: bool,
    pub tlsv1_0: bool,
    pub tlsv1_1: bool,
    pub tlsv1_2: bool,
}

/// Listener configuration, shaped like the embedding server's option bag.
#[derive(Default)]
pub struct AcceptorOpts {
    /// Path to a PEM certificate chain.
    pub certificate_chain_path: Option<PathBuf>,
    /// Inline PEM certificate chain; wins over the path.
    pub certificate_pem: Option<Vec<u8>>,
    pub private_key_path: Option<PathBuf>,
    pub private_key_pem: Option<Vec<u8>>,
    /// The name this acceptor serves; SNI offers are checked against it.
    pub common_name: Option<String>,
    pub cipher_list: Option<Vec<String>>,
    pub cipher_blacklist: Vec<String>,
    pub curve_list: Option<Vec<String>>,
    pub ssl_disable: SslDisable,
    /// Concurrent inbound handshakes, total and per remote IP.
    pub handshaking_max: usize,
    pub handshaking_max_per_peer: usize,
    /// Budget for one inbound handshake.
    pub timeout: Duration,
}

impl AcceptorOpts {
    pub fn from_config(config: &Config) -> AcceptorOpts {
        AcceptorOpts {
            handshaking_max: config.handshaking_max,
            handshaking_max_per_peer: config.handshaking_max_per_peer,
            timeout: config.acceptor_timeout,
            ..AcceptorOpts::default()
        }
    }
}

/// Called with each accepted, handshaken socket.
pub type OnAccept = Box<dyn Fn(Rc<Socket>)>;

/// ALPN callback: the client's offered protocols, in order; return the
/// selection or `None` for no ALPN (the default behavior).
pub type OnProffer = Box<dyn Fn(&[Vec<u8>]) -> Option<Vec<u8>>>;

pub struct Listener {
    inner: Rc<Inner>,
}

struct Inner {
    name: String,
    opts: AcceptorOpts,
    base: Arc<ServerConfig>,
    listener: RefCell<Option<TcpListener>>,
    key: Cell<Option<usize>>,
    handshaking: Cell<usize>,
    per_ip: RefCell<HashMap<IpAddr, usize>>,
    closing: Cell<bool>,
    drained: Dock,
    on_accept: OnAccept,
    on_proffer: Option<OnProffer>,
    accept_task: RefCell<Option<TaskHandle>>,
    hs_tasks: RefCell<Vec<TaskHandle>>,
}

impl Listener {
    /// Bind `addr` and begin accepting. `on_accept` receives each socket
    /// after its handshake; `on_proffer` selects an ALPN protocol.
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        opts: AcceptorOpts,
        on_accept: OnAccept,
        on_proffer: Option<OnProffer>,
    ) -> Result<Listener> {
        let name = name.into();
        let base = server_config(&opts)?;
        let mut listener = TcpListener::bind(addr).map_err(Error::new_accept)?;
        let key = runtime::with(|handle| handle.reactor.register(&mut listener))?;
        debug!("listener:{} bound {}", name, addr);

        let inner = Rc::new(Inner {
            name,
            opts,
            base,
            listener: RefCell::new(Some(listener)),
            key: Cell::new(Some(key)),
            handshaking: Cell::new(0),
            per_ip: RefCell::new(HashMap::new()),
            closing: Cell::new(false),
            drained: Dock::new(),
            on_accept,
            on_proffer,
            accept_task: RefCell::new(None),
            hs_tasks: RefCell::new(Vec::new()),
        });

        let loop_inner = inner.clone();
        let task = exec::spawn(
            SpawnOpts::default().name(format!("listener:{}", inner.name)),
            async move {
                if let Err(err) = accept_loop(&loop_inner).await {
                    if !err.is_interrupted() {
                        warn!("listener:{} accept loop: {}", loop_inner.name, err);
                    }
                }
            },
        );
        *inner.accept_task.borrow_mut() = Some(task);
        Ok(Listener { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let listener = self.inner.listener.borrow();
        match listener.as_ref() {
            Some(listener) => listener.local_addr().map_err(Error::new_io),
            None => Err(Error::new_io(io::ErrorKind::NotConnected.into())),
        }
    }

    /// Handshakes currently in flight.
    pub fn handshaking(&self) -> usize {
        self.inner.handshaking.get()
    }

    /// Stop accepting, cancel outstanding handshakes and wait for them to
    /// drain.
    pub async fn close(&self) -> Result<()> {
        debug!("listener:{} closing", self.inner.name);
        self.inner.closing.set(true);
        if let Some(task) = self.inner.accept_task.borrow_mut().take() {
            task.interrupt();
            let _ = task.join().await;
        }
        let tasks: Vec<_> = self.inner.hs_tasks.borrow_mut().drain(..).collect();
        for task in &tasks {
            task.interrupt();
        }
        for task in tasks {
            let _ = task.join().await;
        }
        self.inner
            .drained
            .wait_when(|| self.inner.handshaking.get() == 0)
            .await?;
        if let Some(key) = self.inner.key.take() {
            if let Some(mut listener) = self.inner.listener.borrow_mut().take() {
                runtime::try_with(|handle| {
                    let _ = handle.reactor.deregister(&mut listener, key);
                });
            }
        }
        Ok(())
    }
}

async fn accept_loop(inner: &Rc<Inner>) -> Result<()> {
    loop {
        ready_read(inner).await?;
        loop {
            let accepted = {
                let listener = inner.listener.borrow();
                match listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return Ok(()),
                }
            };
            match accepted {
                Ok((stream, remote)) => admit(inner, stream, remote),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(key) = inner.key.get() {
                        runtime::try_with(|h| h.reactor.clear_ready(key, Dir::Read));
                    }
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_accept(err)),
            }
        }
    }
}

/// Admit or reset one inbound connection, then hand it to a handshake task.
fn admit(inner: &Rc<Inner>, stream: mio::net::TcpStream, remote: SocketAddr) {
    let ip = remote.ip();
    let per_ip = inner.per_ip.borrow().get(&ip).copied().unwrap_or(0);
    if inner.handshaking.get() >= inner.opts.handshaking_max
        || per_ip >= inner.opts.handshaking_max_per_peer
    {
        warn!(
            "listener:{} rejecting {}: {} handshaking, {} from this peer",
            inner.name,
            remote,
            inner.handshaking.get(),
            per_ip
        );
        let _ = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO));
        return;
    }

    inner.handshaking.set(inner.handshaking.get() + 1);
    *inner.per_ip.borrow_mut().entry(ip).or_insert(0) += 1;

    let hs_inner = inner.clone();
    let task = exec::spawn(
        SpawnOpts::default().name(format!("listener:{}:hs", inner.name)),
        async move {
            let guard = HsGuard {
                inner: hs_inner.clone(),
                ip,
            };
            match handshake_one(&hs_inner, stream, remote).await {
                Ok(sock) => {
                    drop(guard);
                    (hs_inner.on_accept)(sock);
                }
                Err(err) => {
                    if !err.is_interrupted() {
                        debug!("listener:{} handshake with {}: {}", hs_inner.name, remote, err);
                    }
                }
            }
        },
    );
    prune_finished(inner);
    inner.hs_tasks.borrow_mut().push(task);
}

fn prune_finished(inner: &Rc<Inner>) {
    inner.hs_tasks.borrow_mut().retain(|task| !task.finished());
}

async fn handshake_one(
    inner: &Rc<Inner>,
    stream: mio::net::TcpStream,
    remote: SocketAddr,
) -> Result<Rc<Socket>> {
    let _ = socket2::SockRef::from(&stream).set_nonblocking(true);
    let sock = Socket::from_stream(stream)?;
    let deadline = Instant::now() + inner.opts.timeout;

    // read up to the ClientHello
    let mut acceptor = TlsAcceptor::default();
    let accepted = loop {
        let read = sock.with_stream(|io| acceptor.read_tls(io))?;
        match read {
            Ok(0) => {
                sock.close_now();
                return Err(Error::new_tls("peer closed before ClientHello"));
            }
            Ok(_) => match acceptor.accept() {
                Ok(Some(accepted)) => break accepted,
                Ok(None) => {}
                Err((err, _alert)) => {
                    sock.close_now();
                    return Err(Error::new_tls(err));
                }
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if let Err(err) = sock.ready_until(Dir::Read, Some(deadline)).await {
                    sock.close_now();
                    return Err(err);
                }
            }
            Err(err) => {
                sock.close_now();
                return Err(Error::new_io(err));
            }
        }
    };

    let hello = accepted.client_hello();

    // SNI: the offered name must be the one this acceptor serves
    if let Some(expected) = &inner.opts.common_name {
        match hello.server_name() {
            Some(offered) if offered.eq_ignore_ascii_case(expected) => {}
            offered => {
                warn!(
                    "listener:{} SNI mismatch from {}: offered {:?}, serving {:?}",
                    inner.name, remote, offered, expected
                );
                sock.close_now();
                return Err(Error::new_tls("SNI name not served here"));
            }
        }
    }

    // ALPN: hand the client's list to the callback; no selection by default
    let config = match (&inner.on_proffer, hello.alpn()) {
        (Some(proffer), Some(alpn)) => {
            let offered: Vec<Vec<u8>> = alpn.map(|proto| proto.to_vec()).collect();
            trace!(
                "listener:{} ALPN offered {} protocols from {}",
                inner.name,
                offered.len(),
                remote
            );
            match proffer(&offered) {
                Some(selected) => {
                    let mut config = (*inner.base).clone();
                    config.alpn_protocols = vec![selected];
                    Arc::new(config)
                }
                None => inner.base.clone(),
            }
        }
        _ => inner.base.clone(),
    };

    let conn = match accepted.into_connection(config) {
        Ok(conn) => conn,
        Err((err, _alert)) => {
            sock.close_now();
            return Err(Error::new_tls(err));
        }
    };
    sock.set_session(rustls::Connection::Server(conn));
    if let Err(err) = sock.handshake(deadline).await {
        sock.close_now();
        return Err(err);
    }
    debug!("listener:{} accepted {}", inner.name, remote);
    Ok(sock)
}

struct HsGuard {
    inner: Rc<Inner>,
    ip: IpAddr,
}

impl Drop for HsGuard {
    fn drop(&mut self) {
        self.inner.handshaking.set(self.inner.handshaking.get() - 1);
        let mut per_ip = self.inner.per_ip.borrow_mut();
        if let Some(count) = per_ip.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&self.ip);
            }
        }
        drop(per_ip);
        self.inner.drained.notify_all();
    }
}

fn ready_read(inner: &Rc<Inner>) -> impl StdFuture<Output = Result<()>> + '_ {
    ListenReady { inner }
}

struct ListenReady<'a> {
    inner: &'a Rc<Inner>,
}

impl StdFuture for ListenReady<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        crate::exec::check_interrupt()?;
        let Some(key) = self.inner.key.get() else {
            return Poll::Ready(Err(Error::new_io(io::ErrorKind::NotConnected.into())));
        };
        match runtime::with(|handle| handle.reactor.poll_ready(key, Dir::Read, cx)) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(Error::new_io(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn server_config(opts: &AcceptorOpts) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = if let Some(pem) = &opts.certificate_pem {
        CertificateDer::pem_slice_iter(pem)
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| Error::new_tls(format!("certificate pem: {}", err)))?
    } else if let Some(path) = &opts.certificate_chain_path {
        CertificateDer::pem_file_iter(path)
            .map_err(|err| Error::new_tls(format!("certificate file: {}", err)))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| Error::new_tls(format!("certificate file: {}", err)))?
    } else {
        return Err(Error::new_tls("acceptor has no certificate"));
    };

    let key: PrivateKeyDer<'static> = if let Some(pem) = &opts.private_key_pem {
        PrivateKeyDer::from_pem_slice(pem)
            .map_err(|err| Error::new_tls(format!("private key pem: {}", err)))?
    } else if let Some(path) = &opts.private_key_path {
        PrivateKeyDer::from_pem_file(path)
            .map_err(|err| Error::new_tls(format!("private key file: {}", err)))?
    } else {
        return Err(Error::new_tls("acceptor has no private key"));
    };

    let provider = tls::filter_provider(
        opts.cipher_list.as_deref(),
        &opts.cipher_blacklist,
        opts.curve_list.as_deref(),
    );
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = if opts.ssl_disable.tlsv1_2 {
        vec![&rustls::version::TLS13]
    } else {
        vec![&rustls::version::TLS12, &rustls::version::TLS13]
    };

    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)
        .map_err(Error::new_tls)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::new_tls)?;
    Ok(Arc::new(config))
}
