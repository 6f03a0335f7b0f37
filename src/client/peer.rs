//! All state for one remote endpoint, keyed by canonical hostname.
//!
//! The peer resolves its remote lazily, fans tags out across its links
//! under the link and pipeline caps, and latches an error (refusing new
//! submissions for a cool-down) when its first link cannot be opened or
//! when the remote answers with an upstream-failure status.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::client::link::Link;
use crate::client::tag::Tag;
use crate::config::Config;
use crate::net::dns::wire::{Rdata, Record};
use crate::net::dns::ResolveOpts;
use crate::net::{HostPort, OpenOpts};
use crate::{Error, Result};

use super::ClientInner;

/// Statuses that mark the remote (or its fronting CDN) as down; cached so
/// a dead host is not pounded for the cool-down window.
const ERRANT_STATUSES: [u16; 5] = [502, 504, 520, 522, 524];

pub(crate) struct Peer {
    hostport: HostPort,
    client: Weak<ClientInner>,
    config: Config,

    links: RefCell<Vec<Rc<Link>>>,
    link_ids: Cell<u64>,

    remote: Cell<Option<SocketAddr>>,
    remote_expiry: Cell<Option<Instant>>,
    resolving: Cell<bool>,
    pending: RefCell<VecDeque<Rc<RefCell<Tag>>>>,

    err: RefCell<Option<Latched>>,
    server_version: RefCell<Option<String>>,
    opened_once: Cell<bool>,

    pub(crate) tags_done: Cell<u64>,
}

struct Latched {
    message: String,
    etime: Instant,
}

impl Peer {
    pub(crate) fn new(client: Weak<ClientInner>, hostport: HostPort, config: Config) -> Peer {
        Peer {
            hostport,
            client,
            config,
            links: RefCell::new(Vec::new()),
            link_ids: Cell::new(0),
            remote: Cell::new(None),
            remote_expiry: Cell::new(None),
            resolving: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            err: RefCell::new(None),
            server_version: RefCell::new(None),
            opened_once: Cell::new(false),
            tags_done: Cell::new(0),
        }
    }

    pub(crate) fn hostport(&self) -> &HostPort {
        &self.hostport
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// The remote's one-time captured `Server:` banner.
    pub(crate) fn server_version(&self) -> Option<String> {
        self.server_version.borrow().clone()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.borrow().len()
    }

    fn ready_links(&self) -> usize {
        self.links.borrow().iter().filter(|link| link.ready()).count()
    }

    // ===== error latch =====

    /// The latched message while still inside the cool-down; clears the
    /// latch once the window has passed.
    fn errant_message(&self) -> Option<String> {
        let mut err = self.err.borrow_mut();
        match &*err {
            Some(latched) if Instant::now() < latched.etime + self.config.error_clear => {
                Some(latched.message.clone())
            }
            Some(_) => {
                debug!("peer {} error cool-down elapsed", self.hostport);
                *err = None;
                None
            }
            None => None,
        }
    }

    pub(crate) fn errant(&self) -> bool {
        self.errant_message().is_some()
    }

    fn err_latch(&self, message: String) {
        warn!("peer {} latched: {}", self.hostport, message);
        *self.err.borrow_mut() = Some(Latched {
            message,
            etime: Instant::now(),
        });
    }

    // ===== submission =====

    pub(crate) fn submit(self: &Rc<Self>, tag: Rc<RefCell<Tag>>) {
        if let Some(message) = self.errant_message() {
            tag.borrow_mut().fail(Error::new_unavailable(message));
            return;
        }
        let expired = self
            .remote_expiry
            .get()
            .map(|expiry| Instant::now() >= expiry)
            .unwrap_or(true);
        if self.remote.get().is_none() || expired {
            trace!("peer {} queueing tag for resolution", self.hostport);
            self.pending.borrow_mut().push_back(tag);
            self.start_resolve();
            return;
        }
        self.assign(tag);
    }

    /// Re-home a tag from a dying link.
    pub(crate) fn resubmit(self: &Rc<Self>, tag: Rc<RefCell<Tag>>) {
        if let Some(message) = self.errant_message() {
            tag.borrow_mut().fail(Error::new_unavailable(message));
            return;
        }
        {
            let mut state = tag.borrow_mut();
            if state.resubmits >= 1 {
                state.fail(
                    Error::new_canceled_with("link closed before the request committed"),
                );
                return;
            }
            state.resubmits += 1;
        }
        self.assign(tag);
    }

    fn assign(self: &Rc<Self>, tag: Rc<RefCell<Tag>>) {
        let priority = tag.borrow().priority();
        match self.best_link() {
            Some(link) if priority == i8::MIN && link.tag_committed() > 0 => {
                // demanded a dedicated link
                self.open_link_for(tag);
            }
            Some(link) => link.queue_tag(tag),
            None => self.open_link_for(tag),
        }
    }

    /// Best candidate: skip closing/excluded/saturated links, prefer the
    /// least pending write bytes, then read bytes, then tag count. A second
    /// pass admits saturated links once the link cap is reached.
    fn best_link(&self) -> Option<Rc<Link>> {
        let links = self.links.borrow();
        let better = |best: Option<&Rc<Link>>, cand: &Rc<Link>| -> bool {
            match best {
                None => true,
                Some(best) => {
                    let a = (
                        cand.write_remaining(),
                        cand.read_remaining(),
                        cand.tag_count(),
                    );
                    let b = (
                        best.write_remaining(),
                        best.read_remaining(),
                        best.tag_count(),
                    );
                    a < b
                }
            }
        };
        let mut best: Option<&Rc<Link>> = None;
        for link in links.iter().filter(|l| l.usable() && !l.saturated()) {
            if better(best, link) {
                best = Some(link);
            }
        }
        if best.is_none() && links.len() >= self.config.link_max {
            for link in links.iter().filter(|l| l.usable()) {
                if better(best, link) {
                    best = Some(link);
                }
            }
        }
        best.cloned()
    }

    fn open_link_for(self: &Rc<Self>, tag: Rc<RefCell<Tag>>) {
        if self.links.borrow().len() >= self.config.link_max {
            // at cap with nothing usable
            match self.best_link() {
                Some(link) => link.queue_tag(tag),
                None => tag
                    .borrow_mut()
                    .fail(Error::new_canceled_with("no link available")),
            }
            return;
        }
        match self.open_link() {
            Ok(link) => link.queue_tag(tag),
            Err(err) => tag.borrow_mut().fail(err),
        }
    }

    fn open_link(self: &Rc<Self>) -> Result<Rc<Link>> {
        let Some(addr) = self.remote.get() else {
            return Err(Error::new_unavailable("peer has no resolved remote"));
        };
        let id = self.link_ids.get() + 1;
        self.link_ids.set(id);
        let opts = OpenOpts::from_config(&self.config, addr, self.hostport.clone());
        debug!("peer {} opening link:{} to {}", self.hostport, id, addr);
        let link = Link::open(self, opts, id);
        self.links.borrow_mut().push(link.clone());
        Ok(link)
    }

    // ===== resolution =====

    fn start_resolve(self: &Rc<Self>) {
        if self.resolving.get() {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        self.resolving.set(true);
        let mut opts = if self.hostport.service.is_some() {
            ResolveOpts::srv()
        } else {
            ResolveOpts::a()
        };
        opts.nxdomain_exceptions = false;
        trace!("peer {} resolving (qtype {})", self.hostport, opts.qtype);
        let peer = self.clone();
        client.resolver.resolve(
            &self.hostport,
            opts,
            Box::new(move |result| peer.resolved(result)),
        );
    }

    fn resolved(self: Rc<Self>, result: Result<Vec<Record>>) {
        self.resolving.set(false);
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                self.resolve_failed(err.to_string());
                return;
            }
        };

        // an SRV winner redirects to its target and port
        let srv = records
            .iter()
            .filter_map(|record| match &record.rdata {
                Some(Rdata::Srv(srv)) => Some(srv.clone()),
                _ => None,
            })
            .min_by_key(|srv| (srv.priority, std::cmp::Reverse(srv.weight)));
        if let Some(srv) = srv {
            let Some(client) = self.client.upgrade() else {
                return;
            };
            debug!(
                "peer {} SRV -> {}:{}",
                self.hostport, srv.target, srv.port
            );
            let mut opts = ResolveOpts::a();
            opts.nxdomain_exceptions = false;
            let target = HostPort::new(srv.target.clone(), srv.port);
            let peer = self.clone();
            let port = srv.port;
            client.resolver.resolve(
                &target,
                opts,
                Box::new(move |result| peer.resolved_address(result, port)),
            );
            return;
        }

        let port = self.hostport.port;
        self.resolved_address(Ok(records), port);
    }

    fn resolved_address(self: Rc<Self>, result: Result<Vec<Record>>, port: u16) {
        self.resolving.set(false);
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                self.resolve_failed(err.to_string());
                return;
            }
        };
        let address = records.iter().find_map(|record| match &record.rdata {
            Some(Rdata::A(ip)) => Some((IpAddr::V4(*ip), record.ttl)),
            Some(Rdata::Aaaa(ip)) if self.config.enable_ipv6 => {
                Some((IpAddr::V6(*ip), record.ttl))
            }
            _ => None,
        });
        match address {
            Some((ip, ttl)) => self.set_remote(SocketAddr::new(ip, port), ttl),
            None => self.resolve_failed(format!("no address for {}", self.hostport.host)),
        }
    }

    fn set_remote(self: &Rc<Self>, addr: SocketAddr, ttl: u32) {
        let ttl = Duration::from_secs(ttl as u64).clamp(
            self.config.remote_ttl_min,
            self.config.remote_ttl_max,
        );
        debug!(
            "peer {} remote {} for {}s",
            self.hostport,
            addr,
            ttl.as_secs()
        );
        self.remote.set(Some(addr));
        self.remote_expiry.set(Some(Instant::now() + ttl));
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        for tag in pending {
            self.assign(tag);
        }
    }

    fn resolve_failed(self: &Rc<Self>, message: String) {
        self.err_latch(message.clone());
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        for tag in pending {
            tag.borrow_mut().fail(Error::new_unavailable(message.clone()));
        }
    }

    // ===== link callbacks =====

    pub(crate) fn link_opened(&self, link: &Rc<Link>) {
        trace!("peer {} link:{} opened", self.hostport, link.id);
        self.opened_once.set(true);
    }

    pub(crate) fn link_failed(self: &Rc<Self>, link: &Rc<Link>, err: Error) {
        debug!("peer {} link:{} failed: {}", self.hostport, link.id, err);
        if !self.opened_once.get() {
            // an unreachable host must not collect a fan-out of doomed links
            self.err_latch(err.to_string());
        }
        let tags = link.take_tags();
        self.remove_link(link);
        for tag in tags {
            if tag.borrow().committed() {
                tag.borrow_mut().fail(err.replicate());
            } else {
                self.resubmit(tag);
            }
        }
    }

    pub(crate) fn link_closed(&self, link: &Rc<Link>) {
        trace!("peer {} link:{} closed", self.hostport, link.id);
        self.remove_link(link);
    }

    fn remove_link(&self, link: &Rc<Link>) {
        self.links
            .borrow_mut()
            .retain(|other| !Rc::ptr_eq(other, link));
    }

    /// A tag's response is complete: deliver it and apply peer policy.
    pub(crate) fn tag_done(self: &Rc<Self>, link: &Rc<Link>, tag: Rc<RefCell<Tag>>) {
        self.tags_done.set(self.tags_done.get() + 1);
        let (status, server) = tag.borrow_mut().complete();
        trace!(
            "peer {} link:{} tag done status={}",
            self.hostport,
            link.id,
            status
        );
        if let Some(server) = server {
            let mut version = self.server_version.borrow_mut();
            if version.is_none() {
                debug!("peer {} server: {}", self.hostport, server);
                *version = Some(server);
            }
        }
        if ERRANT_STATUSES.contains(&status) {
            self.err_latch(format!("remote answered {}", status));
        }
        if link.tag_count() == 0 && self.ready_links() > self.config.link_min {
            link.close(false);
        }
    }

    // ===== cancellation =====

    /// User-side cancel. An uncommitted tag is removed outright; a
    /// committed one keeps draining invisibly, and a pipeline of nothing
    /// but canceled tags is cut short with a reset.
    pub(crate) fn cancel(self: &Rc<Self>, tag: &Rc<RefCell<Tag>>) {
        let (done, committed, already) = {
            let state = tag.borrow();
            (state.done, state.committed(), state.canceled)
        };
        if done || already {
            return;
        }
        debug!(
            "peer {} cancel tag:{} committed={}",
            self.hostport,
            tag.borrow().id,
            committed
        );
        tag.borrow_mut().cancel();
        if !committed {
            self.pending.borrow_mut().retain(|other| !Rc::ptr_eq(other, tag));
            let links: Vec<_> = self.links.borrow().clone();
            for link in links {
                if link.remove_tag(tag) {
                    break;
                }
            }
            return;
        }
        let links: Vec<_> = self.links.borrow().clone();
        for link in links {
            if link.contains(tag) {
                if link.all_canceled() {
                    link.close(true);
                }
                break;
            }
        }
    }

    /// Fail everything outstanding and close all links.
    pub(crate) fn cancel_all(self: &Rc<Self>) {
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        for tag in pending {
            tag.borrow_mut().fail(Error::new_canceled());
        }
        let links: Vec<_> = self.links.borrow().clone();
        for link in links {
            link.cancel_all();
        }
    }

    /// Whether every link has fully shut down.
    pub(crate) fn drained(&self) -> bool {
        self.links.borrow().iter().all(|link| link.finished())
    }
}
