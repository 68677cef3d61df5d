//! Pads: the links between elements.
//!
//! A source pad pushes items to its linked sink pad's chain function.
//! Probes run on the pushing thread before delivery and can pass,
//! drop, or remove themselves. A blocked pad queues items; unblocking
//! flushes the queue in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::buffer::FeedItem;

/// What a probe decides for the item it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Deliver the item downstream.
    Pass,
    /// Deliver the item downstream and uninstall this probe.
    PassAndRemove,
    /// Swallow the item; later probes do not see it.
    Drop,
    /// Swallow the item and uninstall this probe.
    Remove,
}

/// Which items a probe is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Buffers,
    Events,
    All,
}

impl ProbeKind {
    fn matches(self, item: &FeedItem) -> bool {
        match self {
            ProbeKind::Buffers => item.is_buffer(),
            ProbeKind::Events => item.is_event(),
            ProbeKind::All => true,
        }
    }
}

pub type ProbeFn = Arc<dyn Fn(&FeedItem) -> ProbeAction + Send + Sync>;

/// Chain function of the downstream peer.
pub type ChainFn = Arc<dyn Fn(FeedItem) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeId(u64);

struct PadInner {
    probes: Vec<(ProbeId, ProbeKind, ProbeFn)>,
    peer: Option<ChainFn>,
    blocked: bool,
    queue: VecDeque<FeedItem>,
    next_probe_id: u64,
}

/// One pad. Cheap to clone; clones share the pad.
#[derive(Clone)]
pub struct Pad {
    name: Arc<str>,
    inner: Arc<Mutex<PadInner>>,
}

impl Pad {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(PadInner {
                probes: Vec::new(),
                peer: None,
                blocked: false,
                queue: VecDeque::new(),
                next_probe_id: 1,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link this (source) pad to a downstream chain function.
    pub fn link(&self, chain: ChainFn) {
        self.inner.lock().unwrap().peer = Some(chain);
    }

    pub fn unlink(&self) {
        self.inner.lock().unwrap().peer = None;
    }

    pub fn is_linked(&self) -> bool {
        self.inner.lock().unwrap().peer.is_some()
    }

    pub fn add_probe(&self, kind: ProbeKind, probe: ProbeFn) -> ProbeId {
        let mut inner = self.inner.lock().unwrap();
        let id = ProbeId(inner.next_probe_id);
        inner.next_probe_id += 1;
        inner.probes.push((id, kind, probe));
        id
    }

    pub fn remove_probe(&self, id: ProbeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.probes.retain(|(pid, _, _)| *pid != id);
    }

    /// Stop delivery; pushed items queue until [`Pad::unblock`].
    pub fn block(&self) {
        self.inner.lock().unwrap().blocked = true;
    }

    /// Resume delivery, flushing queued items in arrival order.
    pub fn unblock(&self) {
        loop {
            let (item, chain) = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some(item) => (item, inner.peer.clone()),
                    None => {
                        inner.blocked = false;
                        return;
                    }
                }
            };
            if let Some(chain) = chain {
                chain(item);
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.lock().unwrap().blocked
    }

    /// Push an item through probes and on to the peer. Called from
    /// whatever thread produced the item.
    pub fn push(&self, item: FeedItem) {
        // Probes run outside the lock so a probe may call back into
        // the pad.
        let probes = self.inner.lock().unwrap().probes.clone();
        let mut removed = Vec::new();
        let mut verdict = ProbeAction::Pass;
        for (id, kind, probe) in &probes {
            if !kind.matches(&item) {
                continue;
            }
            match probe(&item) {
                ProbeAction::Pass => {}
                ProbeAction::PassAndRemove => removed.push(*id),
                ProbeAction::Drop => {
                    verdict = ProbeAction::Drop;
                    break;
                }
                ProbeAction::Remove => {
                    removed.push(*id);
                    verdict = ProbeAction::Drop;
                    break;
                }
            }
        }

        let chain = {
            let mut inner = self.inner.lock().unwrap();
            inner.probes.retain(|(id, _, _)| !removed.contains(id));
            if verdict != ProbeAction::Pass {
                return;
            }
            if inner.blocked {
                inner.queue.push_back(item);
                return;
            }
            inner.peer.clone()
        };
        if let Some(chain) = chain {
            chain(item);
        }
    }
}
