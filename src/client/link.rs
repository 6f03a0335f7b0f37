//! One TCP+TLS connection belonging to a peer, owning a FIFO of tags.
//!
//! Two driver tasks per link: the writer opens the socket, then drains
//! request bytes tag by tag in queue order, pausing new commits at the
//! pipeline cap; the reader parses responses into the head committed tag
//! and passes overrun bytes to its successor. Order is strictly preserved
//! on both paths.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::client::peer::Peer;
use crate::client::tag::{Sift, Tag};
use crate::error::Parse;
use crate::exec::{self, Dock, SpawnOpts, TaskHandle, UninterruptibleNothrow};
use crate::net::{self, CloseOpts, CloseType, OpenOpts, Socket, WaitOpts};
use crate::{Error, Result};

pub(crate) struct Link {
    pub(crate) id: u64,
    peer: Weak<Peer>,
    socket: RefCell<Option<Rc<Socket>>>,
    tags: RefCell<VecDeque<Rc<RefCell<Tag>>>>,

    op_init: Cell<bool>,
    op_fini: Cell<bool>,
    opened: Cell<bool>,
    closing: Cell<bool>,
    close_rst: Cell<bool>,
    excluded: Cell<bool>,

    work: Dock,
    readable: Dock,
    tasks: RefCell<Vec<TaskHandle>>,

    pub(crate) write_bytes: Cell<u64>,
    pub(crate) read_bytes: Cell<u64>,
    pub(crate) tags_done: Cell<u64>,

    tag_commit_max: usize,
    tag_max: usize,
    close_timeout: Duration,
}

impl Link {
    /// Create the link and begin connecting; tags may be queued
    /// immediately.
    pub(crate) fn open(peer: &Rc<Peer>, opts: OpenOpts, id: u64) -> Rc<Link> {
        let config = peer.config();
        let link = Rc::new(Link {
            id,
            peer: Rc::downgrade(peer),
            socket: RefCell::new(None),
            tags: RefCell::new(VecDeque::new()),
            op_init: Cell::new(false),
            op_fini: Cell::new(false),
            opened: Cell::new(false),
            closing: Cell::new(false),
            close_rst: Cell::new(false),
            excluded: Cell::new(false),
            work: Dock::new(),
            readable: Dock::new(),
            tasks: RefCell::new(Vec::new()),
            write_bytes: Cell::new(0),
            read_bytes: Cell::new(0),
            tags_done: Cell::new(0),
            tag_commit_max: config.tag_commit_max,
            tag_max: config.tag_max,
            close_timeout: config.close_timeout,
        });
        let driver = link.clone();
        let driver_peer = peer.clone();
        let task = exec::spawn(
            SpawnOpts::default().name(format!("link:{}:{}", peer.hostport(), id)),
            async move {
                driver_main(driver, driver_peer, opts).await;
            },
        );
        link.tasks.borrow_mut().push(task);
        link
    }

    // ===== state =====

    pub(crate) fn finished(&self) -> bool {
        !self.opened.get() && self.op_fini.get() && !self.op_init.get()
    }

    /// Usable for new tags.
    pub(crate) fn usable(&self) -> bool {
        !self.closing.get()
            && !self.op_fini.get()
            && !self.excluded.get()
            && self.tag_count() < self.tag_max
    }

    pub(crate) fn ready(&self) -> bool {
        self.opened.get() && !self.closing.get() && !self.op_fini.get()
    }

    pub(crate) fn exclude(&self) {
        self.excluded.set(true);
    }

    pub(crate) fn tag_count(&self) -> usize {
        self.tags.borrow().len()
    }

    pub(crate) fn tag_committed(&self) -> usize {
        self.tags
            .borrow()
            .iter()
            .filter(|tag| {
                let tag = tag.borrow();
                tag.committed() && !tag.done
            })
            .count()
    }

    pub(crate) fn saturated(&self) -> bool {
        self.tag_committed() >= self.tag_commit_max
    }

    pub(crate) fn write_remaining(&self) -> usize {
        self.tags
            .borrow()
            .iter()
            .map(|tag| tag.borrow().write_remaining())
            .sum()
    }

    pub(crate) fn read_remaining(&self) -> usize {
        self.tags
            .borrow()
            .iter()
            .map(|tag| tag.borrow().read_remaining())
            .sum()
    }

    pub(crate) fn all_canceled(&self) -> bool {
        let tags = self.tags.borrow();
        !tags.is_empty() && tags.iter().all(|tag| tag.borrow().canceled)
    }

    // ===== queue =====

    pub(crate) fn queue_tag(&self, tag: Rc<RefCell<Tag>>) {
        trace!("link:{} queue tag:{}", self.id, tag.borrow().id);
        self.tags.borrow_mut().push_back(tag);
        self.work.notify_one();
    }

    pub(crate) fn remove_tag(&self, tag: &Rc<RefCell<Tag>>) -> bool {
        let mut tags = self.tags.borrow_mut();
        let before = tags.len();
        tags.retain(|other| !Rc::ptr_eq(other, tag));
        before != tags.len()
    }

    pub(crate) fn contains(&self, tag: &Rc<RefCell<Tag>>) -> bool {
        self.tags
            .borrow()
            .iter()
            .any(|other| Rc::ptr_eq(other, tag))
    }

    pub(crate) fn take_tags(&self) -> Vec<Rc<RefCell<Tag>>> {
        self.tags.borrow_mut().drain(..).collect()
    }

    // ===== lifecycle =====

    /// Begin closing; `rst` skips the orderly TLS goodbye.
    pub(crate) fn close(&self, rst: bool) {
        if self.closing.get() {
            return;
        }
        debug!("link:{} closing rst={}", self.id, rst);
        self.closing.set(true);
        self.close_rst.set(rst);
        self.work.notify_all();
        self.readable.notify_all();
        // drivers parked on socket readiness only wake via interruption
        for task in self.tasks.borrow().iter() {
            task.interrupt();
        }
    }

    /// Fail every queued tag and close hard.
    pub(crate) fn cancel_all(&self) {
        for tag in self.take_tags() {
            tag.borrow_mut().fail(Error::new_canceled());
        }
        self.close(true);
    }

    /// Error path: committed tags receive the error, uncommitted ones go
    /// back to the peer for another link, and the transport closes. The
    /// link is excluded first so resubmission cannot select it again.
    pub(crate) fn fail_with(&self, peer: &Rc<Peer>, err: Error) {
        debug!("link:{} failed: {}", self.id, err);
        self.exclude();
        let mut committed = Vec::new();
        let mut uncommitted = Vec::new();
        for tag in self.take_tags() {
            if tag.borrow().committed() {
                committed.push(tag);
            } else {
                uncommitted.push(tag);
            }
        }
        for tag in committed {
            tag.borrow_mut().fail(err.replicate());
        }
        for tag in uncommitted {
            peer.resubmit(tag);
        }
        self.close(true);
    }

    fn front_tag(&self) -> Option<Rc<RefCell<Tag>>> {
        self.tags.borrow().front().cloned()
    }

    /// The first committed, unfinished tag; the one the server is
    /// answering.
    fn head_committed(&self) -> Option<Rc<RefCell<Tag>>> {
        let tags = self.tags.borrow();
        let front = tags.front()?;
        let tag = front.borrow();
        if tag.committed() && !tag.done {
            Some(front.clone())
        } else {
            None
        }
    }

    /// The tag whose bytes go on the wire next: writes are strictly FIFO,
    /// and a not-yet-committed tag waits while the pipeline is at cap.
    fn next_write_job(&self) -> Option<Rc<RefCell<Tag>>> {
        let tags = self.tags.borrow();
        let committed = tags
            .iter()
            .filter(|tag| {
                let tag = tag.borrow();
                tag.committed() && !tag.done
            })
            .count();
        for tag in tags.iter() {
            let state = tag.borrow();
            if state.done {
                continue;
            }
            if state.write_remaining() == 0 {
                continue;
            }
            if !state.committed() && committed >= self.tag_commit_max {
                return None;
            }
            drop(state);
            return Some(tag.clone());
        }
        None
    }

    fn pop_tag(&self, tag: &Rc<RefCell<Tag>>) {
        let mut tags = self.tags.borrow_mut();
        if let Some(front) = tags.front() {
            debug_assert!(Rc::ptr_eq(front, tag));
            tags.pop_front();
        }
    }

    /// Route a sift outcome: pop completed tags, deliver them to the peer,
    /// and feed overrun into the successor.
    fn handle_sift(
        self: &Rc<Self>,
        peer: &Rc<Peer>,
        tag: Rc<RefCell<Tag>>,
        mut sift: Sift,
    ) -> Result<()> {
        let mut current = tag;
        loop {
            if sift.done {
                self.pop_tag(&current);
                self.tags_done.set(self.tags_done.get() + 1);
                peer.tag_done(self, current.clone());
                self.work.notify_one();
            }
            if sift.overrun.is_empty() {
                return Ok(());
            }
            let Some(next) = self.front_tag() else {
                return Err(Error::new_parse(Parse::Head)
                    .with("response bytes with no request in the pipeline"));
            };
            let overrun = std::mem::take(&mut sift.overrun);
            trace!(
                "link:{} {} overrun bytes to tag:{}",
                self.id,
                overrun.len(),
                next.borrow().id
            );
            sift = next.borrow_mut().sift(&overrun)?;
            current = next;
        }
    }
}

async fn driver_main(link: Rc<Link>, peer: Rc<Peer>, opts: OpenOpts) {
    link.op_init.set(true);
    let sock = match net::connect(&opts).await {
        Ok(sock) => sock,
        Err(err) => {
            link.op_init.set(false);
            link.op_fini.set(true);
            peer.link_failed(&link, err);
            link.tasks.borrow_mut().clear();
            return;
        }
    };
    link.op_init.set(false);
    link.opened.set(true);
    *link.socket.borrow_mut() = Some(sock);
    debug!("link:{} open to {}", link.id, opts.ipport);
    peer.link_opened(&link);

    let read_link = link.clone();
    let read_peer = peer.clone();
    let reader = exec::spawn(
        SpawnOpts::default().name(format!("link:{}:read", link.id)),
        async move {
            if let Err(err) = read_loop(&read_link, &read_peer).await {
                if !err.is_interrupted() {
                    read_link.fail_with(&read_peer, err);
                }
            }
        },
    );
    link.tasks.borrow_mut().push(reader);

    if let Err(err) = write_loop(&link).await {
        if !err.is_interrupted() {
            link.fail_with(&peer, err);
        }
    }

    // shutdown: orderly unless the close was a reset
    {
        let _quiet = UninterruptibleNothrow::enter();
        let sock = link.socket.borrow_mut().take();
        if let Some(sock) = sock {
            let close = CloseOpts {
                r#type: if link.close_rst.get() {
                    CloseType::Rst
                } else {
                    CloseType::SslNotify
                },
                timeout: link.close_timeout,
            };
            let _ = sock.disconnect(close).await;
        }
    }
    link.opened.set(false);
    link.op_fini.set(true);
    peer.link_closed(&link);
    link.tasks.borrow_mut().clear();
}

async fn write_loop(link: &Rc<Link>) -> Result<()> {
    loop {
        if link.closing.get() {
            return Ok(());
        }
        let Some(tag) = link.next_write_job() else {
            link.work.wait().await?;
            continue;
        };
        let sock = link.socket.borrow().clone();
        let Some(sock) = sock else {
            return Ok(());
        };
        loop {
            if link.closing.get() {
                return Ok(());
            }
            let view = { tag.borrow().write_view() };
            if view.is_empty() {
                break;
            }
            let n = sock.write_one(&view)?;
            if n == 0 {
                sock.wait(WaitOpts::write()).await?;
                continue;
            }
            link.write_bytes.set(link.write_bytes.get() + n as u64);
            let newly_committed = {
                let mut state = tag.borrow_mut();
                let was = state.committed();
                state.advance_written(n);
                !was
            };
            if newly_committed {
                debug!(
                    "link:{} tag:{} starting; {} bytes to write",
                    link.id,
                    tag.borrow().id,
                    tag.borrow().write_remaining()
                );
                link.readable.notify_one();
            }
        }
    }
}

async fn read_loop(link: &Rc<Link>, peer: &Rc<Peer>) -> Result<()> {
    loop {
        if link.closing.get() {
            return Ok(());
        }
        if link.head_committed().is_none() {
            link.readable.wait().await?;
            continue;
        }
        let sock = link.socket.borrow().clone();
        let Some(sock) = sock else {
            return Ok(());
        };
        sock.wait(WaitOpts::read()).await?;
        loop {
            let Some(tag) = link.head_committed() else {
                break;
            };
            let n = {
                let mut state = tag.borrow_mut();
                let buf = state.read_buffer()?;
                match sock.read_one(buf) {
                    Ok(n) => n,
                    // EOF while a committed tag still expects response bytes
                    Err(err) if err.is_eof() => return Err(Error::new_incomplete()),
                    Err(err) => return Err(err),
                }
            };
            if n == 0 {
                break;
            }
            link.read_bytes.set(link.read_bytes.get() + n as u64);
            let sift = { tag.borrow_mut().consume(n)? };
            link.handle_sift(peer, tag, sift)?;
        }
    }
}
