//! HTTP/1.1 client pipeliner.
//!
//! Requests are submitted against a canonical hostname; each peer owns a
//! small pool of TLS links, each link a strict FIFO pipeline of tags. The
//! returned handle resolves through a future; dropping it abandons the
//! request (a committed request keeps draining invisibly).

mod link;
mod parse;
mod peer;
mod request;
mod tag;

pub use self::request::{Progress, Request, RequestOpts, Response};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::Config;
use crate::exec;
use crate::net::dns::Resolver;
use crate::net::HostPort;
use crate::{Error, Result};

use self::peer::Peer;
use self::tag::Tag;

pub struct Client {
    inner: Rc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: Config,
    pub(crate) resolver: Resolver,
    peers: RefCell<HashMap<String, Rc<Peer>>>,
    ids: Cell<u64>,
}

impl Client {
    /// Build the pipeliner and its resolver. Must run on the reactor
    /// thread, inside the runtime.
    pub fn new(config: Config) -> Result<Client> {
        let resolver = Resolver::new(&config)?;
        Ok(Client {
            inner: Rc::new(ClientInner {
                config,
                resolver,
                peers: RefCell::new(HashMap::new()),
                ids: Cell::new(0),
            }),
        })
    }

    /// Submit one request toward `hostport`. The handle's future resolves
    /// with the response or the request's failure.
    pub fn submit(&self, hostport: &HostPort, request: Request) -> RequestHandle {
        let id = self.inner.ids.get() + 1;
        self.inner.ids.set(id);
        let peer = self.peer(hostport);
        debug!("submit tag:{} to {}", id, hostport);
        let (tag, future) = Tag::new(request, id);
        let tag = Rc::new(RefCell::new(tag));
        peer.submit(tag.clone());
        RequestHandle {
            peer,
            tag,
            future: Some(future),
        }
    }

    /// Whether the peer currently refuses submissions from inside its error
    /// cool-down.
    pub fn errant(&self, hostport: &HostPort) -> bool {
        let key = hostport.host.to_ascii_lowercase();
        match self.inner.peers.borrow().get(&key) {
            Some(peer) => peer.errant(),
            None => false,
        }
    }

    /// The one-time captured `Server:` banner for a peer, if seen.
    pub fn server_version(&self, hostport: &HostPort) -> Option<String> {
        let key = hostport.host.to_ascii_lowercase();
        self.inner
            .peers
            .borrow()
            .get(&key)
            .and_then(|peer| peer.server_version())
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.borrow().len()
    }

    pub fn link_count(&self) -> usize {
        self.inner
            .peers
            .borrow()
            .values()
            .map(|peer| peer.link_count())
            .sum()
    }

    /// Cancel everything outstanding, close every link and stop the
    /// resolver.
    pub async fn shutdown(&self) {
        debug!("client shutdown");
        let peers: Vec<_> = self.inner.peers.borrow().values().cloned().collect();
        for peer in &peers {
            peer.cancel_all();
        }
        // links close asynchronously; give them the close budget to drain
        let deadline = Instant::now() + self.inner.config.close_timeout;
        while Instant::now() < deadline {
            if peers.iter().all(|peer| peer.drained()) {
                break;
            }
            if exec::sleep(Duration::from_millis(10)).await.is_err() {
                break;
            }
        }
        self.inner.peers.borrow_mut().clear();
        self.inner.resolver.close().await;
    }

    fn peer(&self, hostport: &HostPort) -> Rc<Peer> {
        let key = hostport.host.to_ascii_lowercase();
        let mut peers = self.inner.peers.borrow_mut();
        peers
            .entry(key)
            .or_insert_with(|| {
                Rc::new(Peer::new(
                    Rc::downgrade(&self.inner),
                    hostport.clone(),
                    self.inner.config.clone(),
                ))
            })
            .clone()
    }
}

/// User handle for one submitted request.
///
/// Dropping the handle without consuming the response cancels the request:
/// the future (if still observed elsewhere) fails with `canceled`, and a
/// committed tag drains the remote's response invisibly.
pub struct RequestHandle {
    peer: Rc<Peer>,
    tag: Rc<RefCell<Tag>>,
    future: Option<crate::exec::Future<Response>>,
}

impl RequestHandle {
    /// Wait for the response. An interruption point.
    pub async fn get(mut self) -> Result<Response> {
        let future = self
            .future
            .take()
            .ok_or_else(Error::new_future_already_retrieved)?;
        future.get().await
    }

    /// Wait for readiness without retrieving; `Ok(false)` on deadline.
    pub async fn wait_until(&self, deadline: Instant) -> Result<bool> {
        match &self.future {
            Some(future) => future.wait_until(deadline).await,
            None => Ok(true),
        }
    }

    /// Abandon the request. The future fails with `canceled` immediately
    /// (and stays retrievable); a committed request continues on the wire
    /// (see the peer's cancellation policy).
    pub fn cancel(&mut self) {
        self.peer.cancel(&self.tag);
    }

    pub fn committed(&self) -> bool {
        self.tag.borrow().committed()
    }

    pub fn done(&self) -> bool {
        self.tag.borrow().done
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.future.is_some() && !self.tag.borrow().done {
            self.peer.cancel(&self.tag);
        }
    }
}
