//! DNS resolver: binary DNS over UDP with pacing, retries and a TTL cache.

mod cache;
pub mod wire;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future as StdFuture;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Dns;
use crate::exec::{self, runtime, Dock, SpawnOpts, TaskHandle};
use crate::{Error, Result};

use self::cache::Cache;
use self::wire::{Question, Rdata, Record, QTYPE_A, QTYPE_AAAA, QTYPE_SRV};

use super::reactor::Dir;
use super::HostPort;

pub use self::wire::{Rdata as DnsRdata, Record as DnsRecord, Srv as DnsSrv};

/// Per-query options.
#[derive(Debug, Clone)]
pub struct ResolveOpts {
    pub qtype: u16,
    /// Insert answers into the cache.
    pub cache_result: bool,
    /// Deliver NXDOMAIN as an error rather than an empty result set.
    pub nxdomain_exceptions: bool,
}

impl ResolveOpts {
    pub fn a() -> ResolveOpts {
        ResolveOpts {
            qtype: QTYPE_A,
            cache_result: true,
            nxdomain_exceptions: true,
        }
    }

    pub fn srv() -> ResolveOpts {
        ResolveOpts {
            qtype: QTYPE_SRV,
            ..ResolveOpts::a()
        }
    }
}

/// Completion callback; runs on the reactor thread.
pub type Callback = Box<dyn FnOnce(Result<Vec<Record>>)>;

pub struct Resolver {
    inner: Rc<Inner>,
    tasks: RefCell<Vec<TaskHandle>>,
}

struct Inner {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    send_rate: Duration,
    send_burst: usize,
    retry_max: u8,
    enable_ipv6: bool,
    udp: RefCell<Option<mio::net::UdpSocket>>,
    key: Cell<Option<usize>>,
    tags: RefCell<HashMap<u16, Tag>>,
    sendq: RefCell<VecDeque<u16>>,
    cache: RefCell<Cache>,
    server_next: Cell<usize>,
    tokens: Cell<f64>,
    last_refill: Cell<Instant>,
    work: Dock,
}

struct Tag {
    question: Question,
    opts: ResolveOpts,
    callback: Option<Callback>,
    tries: u8,
    last_send: Instant,
    server: usize,
}

impl Resolver {
    /// Bind the query socket and start the send/receive drivers. Must be
    /// called on the reactor thread, inside the runtime.
    pub fn new(config: &Config) -> Result<Resolver> {
        let servers = parse_servers(&config.dns_servers)?;
        let mut udp =
            mio::net::UdpSocket::bind("0.0.0.0:0".parse().unwrap()).map_err(Error::new_io)?;
        let key = runtime::with(|handle| handle.reactor.register(&mut udp))?;
        debug!("resolver bound, {} servers", servers.len());

        let inner = Rc::new(Inner {
            servers,
            timeout: config.dns_timeout,
            send_rate: config.dns_send_rate,
            send_burst: config.dns_send_burst,
            retry_max: config.dns_retry_max,
            enable_ipv6: config.enable_ipv6,
            udp: RefCell::new(Some(udp)),
            key: Cell::new(Some(key)),
            tags: RefCell::new(HashMap::new()),
            sendq: RefCell::new(VecDeque::new()),
            cache: RefCell::new(Cache::new(config.dns_min_ttl, config.dns_clear_nxdomain)),
            server_next: Cell::new(0),
            tokens: Cell::new(config.dns_send_burst as f64),
            last_refill: Cell::new(Instant::now()),
            work: Dock::new(),
        });

        let recv_inner = inner.clone();
        let recv_task = exec::spawn(SpawnOpts::default().name("dns:recv"), async move {
            if let Err(err) = recv_loop(&recv_inner).await {
                if !err.is_interrupted() {
                    warn!("dns recv loop: {}", err);
                }
            }
        });
        let pump_inner = inner.clone();
        let pump_task = exec::spawn(SpawnOpts::default().name("dns:pump"), async move {
            if let Err(err) = pump_loop(&pump_inner).await {
                if !err.is_interrupted() {
                    warn!("dns pump loop: {}", err);
                }
            }
        });

        Ok(Resolver {
            inner,
            tasks: RefCell::new(vec![recv_task, pump_task]),
        })
    }

    /// Resolve a hostport. Literal IPs complete synchronously; an SRV query
    /// that comes back empty falls through to A (then AAAA when IPv6 is
    /// enabled) for the bare host.
    pub fn resolve(&self, hostport: &HostPort, opts: ResolveOpts, callback: Callback) {
        if let Some(addr) = hostport.literal() {
            let record = literal_record(addr.ip());
            callback(Ok(vec![record]));
            return;
        }

        if opts.qtype == QTYPE_SRV {
            if let Some(srv_name) = hostport.srv_name() {
                let inner = self.inner.clone();
                let host = hostport.host.clone();
                let fall_opts = opts.clone();
                Inner::lookup(
                    &self.inner,
                    srv_name,
                    QTYPE_SRV,
                    opts,
                    Box::new(move |result| match result {
                        Ok(records) if !records.is_empty() => callback(Ok(records)),
                        Ok(_) => Inner::fallthrough_host(&inner, host, fall_opts, callback),
                        Err(err) if err.is_nxdomain() => {
                            Inner::fallthrough_host(&inner, host, fall_opts, callback)
                        }
                        Err(err) => callback(Err(err)),
                    }),
                );
                return;
            }
        }

        Inner::lookup(&self.inner, hostport.host.clone(), opts.qtype, opts, callback);
    }

    /// Fail every outstanding query with `canceled`.
    pub fn cancel_all(&self) {
        let callbacks: Vec<Callback> = {
            let mut tags = self.inner.tags.borrow_mut();
            self.inner.sendq.borrow_mut().clear();
            tags.drain()
                .filter_map(|(_, mut tag)| tag.callback.take())
                .collect()
        };
        for callback in callbacks {
            callback(Err(Error::new_canceled()));
        }
    }

    pub fn clear_cache(&self) {
        self.inner.cache.borrow_mut().clear();
    }

    /// Outstanding queries.
    pub fn pending(&self) -> usize {
        self.inner.tags.borrow().len()
    }

    /// Stop the driver tasks; outstanding queries are canceled.
    pub async fn close(&self) {
        self.cancel_all();
        let tasks: Vec<_> = self.tasks.borrow_mut().drain(..).collect();
        for task in &tasks {
            task.interrupt();
        }
        for task in tasks {
            let _ = task.join().await;
        }
        if let Some(key) = self.inner.key.take() {
            if let Some(mut udp) = self.inner.udp.borrow_mut().take() {
                runtime::try_with(|handle| {
                    let _ = handle.reactor.deregister(&mut udp, key);
                });
            }
        }
    }
}

impl Inner {
    fn lookup(inner: &Rc<Inner>, qname: String, qtype: u16, opts: ResolveOpts, callback: Callback) {
        let now = Instant::now();
        // cached entries, positive or negative, complete immediately
        let cached = inner.cache.borrow_mut().get(&qname, qtype, now);
        if let Some(entries) = cached {
            if entries.iter().all(|entry| entry.negative()) {
                trace!("dns {} type {} cached NXDOMAIN", qname, qtype);
                deliver_nxdomain(&opts, callback);
            } else {
                let records: Vec<Record> = entries
                    .into_iter()
                    .filter(|entry| !entry.negative())
                    .map(|entry| entry.record)
                    .collect();
                trace!("dns {} type {} cached {} records", qname, qtype, records.len());
                callback(Ok(records));
            }
            return;
        }

        let id = {
            let mut tags = inner.tags.borrow_mut();
            if tags.len() >= u16::MAX as usize {
                drop(tags);
                callback(Err(Error::new_dns(Dns::Refused(5))
                    .with("resolver id space exhausted")));
                return;
            }
            let mut rng = rand::thread_rng();
            let id = loop {
                let id: u16 = rng.gen();
                if !tags.contains_key(&id) {
                    break id;
                }
            };
            let server = inner.server_next.get() % inner.servers.len();
            inner.server_next.set(server + 1);
            tags.insert(
                id,
                Tag {
                    question: Question { name: qname, qtype },
                    opts,
                    callback: Some(callback),
                    tries: 0,
                    last_send: now,
                    server,
                },
            );
            id
        };
        inner.sendq.borrow_mut().push_back(id);
        inner.work.notify_one();
    }

    /// SRV came back empty: try A for the bare host, then AAAA.
    fn fallthrough_host(inner: &Rc<Inner>, host: String, opts: ResolveOpts, callback: Callback) {
        let mut a_opts = opts.clone();
        a_opts.qtype = QTYPE_A;
        a_opts.nxdomain_exceptions = false;
        let inner2 = inner.clone();
        let host2 = host.clone();
        let ipv6 = inner.enable_ipv6;
        Inner::lookup(
            inner,
            host,
            QTYPE_A,
            a_opts.clone(),
            Box::new(move |result| match result {
                Ok(records) if records.is_empty() && ipv6 => {
                    let mut aaaa_opts = a_opts;
                    aaaa_opts.qtype = QTYPE_AAAA;
                    Inner::lookup(&inner2, host2, QTYPE_AAAA, aaaa_opts, callback);
                }
                other => callback(other),
            }),
        );
    }

    fn refill_tokens(&self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill.get());
        self.last_refill.set(now);
        let rate = self.send_rate.as_secs_f64().max(f64::EPSILON);
        let tokens = (self.tokens.get() + elapsed.as_secs_f64() / rate)
            .min(self.send_burst as f64);
        self.tokens.set(tokens);
    }

    fn send_query(&self, id: u16) {
        let (buf, server) = {
            let mut tags = self.tags.borrow_mut();
            let Some(tag) = tags.get_mut(&id) else {
                return;
            };
            let mut buf = Vec::with_capacity(64);
            wire::encode_query(id, &tag.question, &mut buf);
            tag.tries += 1;
            tag.last_send = Instant::now();
            (buf, self.servers[tag.server % self.servers.len()])
        };
        let sent = {
            let udp = self.udp.borrow();
            match udp.as_ref() {
                Some(udp) => udp.send_to(&buf, server),
                None => return,
            }
        };
        match sent {
            Ok(_) => trace!("dns query id={} to {}", id, server),
            Err(err) => warn!("dns send id={} to {}: {}", id, server, err),
        }
    }

    fn on_timeout(&self, id: u16) {
        let retry = {
            let mut tags = self.tags.borrow_mut();
            match tags.get_mut(&id) {
                Some(tag) if tag.tries < self.retry_max => {
                    tag.server = (tag.server + 1) % self.servers.len();
                    true
                }
                Some(_) => false,
                None => return,
            }
        };
        if retry {
            trace!("dns query id={} retrying on next server", id);
            self.sendq.borrow_mut().push_back(id);
            return;
        }
        let callback = {
            let mut tags = self.tags.borrow_mut();
            tags.remove(&id).and_then(|mut tag| tag.callback.take())
        };
        debug!("dns query id={} timed out after retries", id);
        if let Some(callback) = callback {
            callback(Err(Error::new_dns(Dns::TimedOut)));
        }
    }

    fn handle_reply(&self, data: &[u8], from: SocketAddr) {
        let reply = match wire::decode_reply(data) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("dns reply from {}: {}", from, err);
                return;
            }
        };
        let tag = {
            let mut tags = self.tags.borrow_mut();
            let Some(tag) = tags.get(&reply.id) else {
                trace!("dns reply id={} unknown (stale?)", reply.id);
                return;
            };
            // answers must come from the server we asked and answer the
            // question we posed
            let expected = self.servers[tag.server % self.servers.len()];
            let name_matches = reply.questions.iter().any(|q| {
                q.qtype == tag.question.qtype
                    && q.name.eq_ignore_ascii_case(&tag.question.name)
            });
            if from.ip() != expected.ip() || !name_matches {
                warn!("dns reply id={} from {} does not match query", reply.id, from);
                return;
            }
            tags.remove(&reply.id).unwrap()
        };
        let Tag {
            question,
            opts,
            callback,
            ..
        } = tag;
        let Some(callback) = callback else { return };

        match reply.rcode() {
            wire::RCODE_OK => {
                let now = Instant::now();
                let records: Vec<Record> = reply
                    .answers
                    .into_iter()
                    .filter(|answer| answer.qtype == question.qtype)
                    .collect();
                if opts.cache_result {
                    let mut cache = self.cache.borrow_mut();
                    for record in &records {
                        cache.put(&question.name, record.clone(), now);
                    }
                }
                trace!(
                    "dns {} type {} answered with {} records",
                    question.name,
                    question.qtype,
                    records.len()
                );
                callback(Ok(records));
            }
            wire::RCODE_NXDOMAIN => {
                if opts.cache_result {
                    self.cache.borrow_mut().put_nxdomain(
                        &question.name,
                        question.qtype,
                        Instant::now(),
                    );
                }
                debug!("dns {} type {} NXDOMAIN", question.name, question.qtype);
                deliver_nxdomain(&opts, callback);
            }
            rcode => {
                debug!("dns {} rcode {}", question.name, rcode);
                callback(Err(Error::new_dns(Dns::Refused(rcode))));
            }
        }
    }

    /// Nearest pending timeout across outstanding, already-sent queries.
    fn next_timeout(&self) -> Option<Instant> {
        self.tags
            .borrow()
            .values()
            .filter(|tag| tag.tries > 0)
            .map(|tag| tag.last_send + self.timeout)
            .min()
    }

    fn expired(&self, now: Instant) -> Vec<u16> {
        self.tags
            .borrow()
            .iter()
            .filter(|(_, tag)| tag.tries > 0 && now >= tag.last_send + self.timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

async fn pump_loop(inner: &Rc<Inner>) -> Result<()> {
    loop {
        // paced sends
        loop {
            let id = inner.sendq.borrow_mut().pop_front();
            let Some(id) = id else { break };
            inner.refill_tokens();
            if inner.tokens.get() < 1.0 {
                inner.sendq.borrow_mut().push_front(id);
                exec::sleep(inner.send_rate).await?;
                continue;
            }
            inner.tokens.set(inner.tokens.get() - 1.0);
            inner.send_query(id);
        }

        // expiries
        let now = Instant::now();
        for id in inner.expired(now) {
            inner.on_timeout(id);
        }
        if !inner.sendq.borrow().is_empty() {
            continue;
        }

        match inner.next_timeout() {
            Some(deadline) => {
                inner.work.wait_until(deadline).await?;
            }
            None => {
                inner.work.wait().await?;
            }
        }
    }
}

async fn recv_loop(inner: &Rc<Inner>) -> Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        UdpReady { inner }.await?;
        loop {
            let received = {
                let udp = inner.udp.borrow();
                match udp.as_ref() {
                    Some(udp) => udp.recv_from(&mut buf),
                    None => return Ok(()),
                }
            };
            match received {
                Ok((n, from)) => inner.handle_reply(&buf[..n], from),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(key) = inner.key.get() {
                        runtime::try_with(|h| h.reactor.clear_ready(key, Dir::Read));
                    }
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::new_io(err)),
            }
        }
    }
}

struct UdpReady<'a> {
    inner: &'a Rc<Inner>,
}

impl StdFuture for UdpReady<'_> {
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

fn deliver_nxdomain(opts: &ResolveOpts, callback: Callback) {
    if opts.nxdomain_exceptions {
        callback(Err(Error::new_dns(Dns::NxDomain)));
    } else {
        callback(Ok(Vec::new()));
    }
}

fn literal_record(ip: IpAddr) -> Record {
    match ip {
        IpAddr::V4(v4) => Record {
            name: ip.to_string(),
            qtype: QTYPE_A,
            ttl: 0,
            rdata: Some(Rdata::A(v4)),
        },
        IpAddr::V6(v6) => Record {
            name: ip.to_string(),
            qtype: QTYPE_AAAA,
            ttl: 0,
            rdata: Some(Rdata::Aaaa(v6)),
        },
    }
}

fn parse_servers(list: &str) -> Result<Vec<SocketAddr>> {
    let mut servers = Vec::new();
    for part in list.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let addr = if let Ok(ip) = part.parse::<IpAddr>() {
            SocketAddr::new(ip, 53)
        } else {
            part.parse::<SocketAddr>()
                .map_err(|err| Error::new_dns(Dns::Malformed).with(format!("{}: {}", part, err)))?
        };
        servers.push(addr);
    }
    if servers.is_empty() {
        return Err(Error::new_dns(Dns::Malformed).with("empty resolver server list"));
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_list() {
        let servers = parse_servers("4.2.2.1;4.2.2.2; 127.0.0.1:5353 ;").unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].port(), 53);
        assert_eq!(servers[2].port(), 5353);
        assert!(parse_servers("").is_err());
        assert!(parse_servers("not-an-ip").is_err());
    }
}
