// SPDX-License-Identifier: GPL-3.0-only

//! Single-threaded event loop
//!
//! All camera state lives on the thread that owns the [`EventLoop`]. Work
//! reaches it in two ways:
//!
//! ```text
//!   post(FnOnce)          ──► posted queue ──┐
//!                                            ├──► process_events()
//!   add_source(FnMut)     ──► polled sources ┘        ▲
//!                                                     │ wake()
//!   other threads ── LoopWaker ───────────────────────┘
//! ```
//!
//! Sources are polled once per iteration and report whether they did any
//! work; a source returning [`SourceStatus::Disable`] is removed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::constants::timing;

/// Result of polling an event source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Nothing was ready
    Idle,
    /// The source dispatched at least one event
    Dispatched,
    /// The source is done and must not be polled again
    Disable,
}

/// Identifier of a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

type Posted = Box<dyn FnOnce()>;
type Source = Box<dyn FnMut() -> SourceStatus>;

struct SourceEntry {
    id: SourceId,
    name: String,
    // None while the source is being dispatched
    poll: Option<Source>,
    removed: bool,
}

struct Inner {
    posted: RefCell<VecDeque<Posted>>,
    sources: RefCell<Vec<SourceEntry>>,
    next_source: Cell<u64>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: mpsc::Receiver<()>,
}

/// Cloneable handle to the thread-local event loop
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// Thread-safe handle that interrupts a sleeping [`EventLoop`]
#[derive(Clone)]
pub struct LoopWaker {
    tx: mpsc::Sender<()>,
}

impl LoopWaker {
    pub fn wake(&self) {
        // The loop may already be gone; nothing left to wake then
        let _ = self.tx.send(());
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = mpsc::channel();
        Self {
            inner: Rc::new(Inner {
                posted: RefCell::new(VecDeque::new()),
                sources: RefCell::new(Vec::new()),
                next_source: Cell::new(0),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Defer a callback to the next dispatch
    pub fn post(&self, callback: impl FnOnce() + 'static) {
        self.inner.posted.borrow_mut().push_back(Box::new(callback));
    }

    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            tx: self.inner.wake_tx.clone(),
        }
    }

    /// Register a source polled on every iteration
    pub fn add_source(
        &self,
        name: impl Into<String>,
        poll: impl FnMut() -> SourceStatus + 'static,
    ) -> SourceId {
        let id = SourceId(self.inner.next_source.get());
        self.inner.next_source.set(id.0 + 1);
        let name = name.into();
        debug!(source = %name, id = id.0, "Event source registered");
        self.inner.sources.borrow_mut().push(SourceEntry {
            id,
            name,
            poll: Some(Box::new(poll)),
            removed: false,
        });
        id
    }

    /// Unregister a source; safe to call from inside the source itself
    pub fn remove_source(&self, id: SourceId) {
        let mut sources = self.inner.sources.borrow_mut();
        if let Some(entry) = sources.iter_mut().find(|e| e.id == id) {
            entry.removed = true;
        }
        sources.retain(|e| !e.removed || e.poll.is_none());
    }

    pub fn has_source(&self, id: SourceId) -> bool {
        self.inner
            .sources
            .borrow()
            .iter()
            .any(|e| e.id == id && !e.removed)
    }

    pub fn source_count(&self) -> usize {
        self.inner
            .sources
            .borrow()
            .iter()
            .filter(|e| !e.removed)
            .count()
    }

    /// Run posted callbacks and poll every source once
    ///
    /// Returns the number of callbacks and sources that did work.
    pub fn dispatch_pending(&self) -> usize {
        let mut work = 0;

        loop {
            let next = self.inner.posted.borrow_mut().pop_front();
            match next {
                Some(callback) => {
                    callback();
                    work += 1;
                }
                None => break,
            }
        }

        let ids: Vec<SourceId> = self.inner.sources.borrow().iter().map(|e| e.id).collect();
        for id in ids {
            let taken = {
                let mut sources = self.inner.sources.borrow_mut();
                sources
                    .iter_mut()
                    .find(|e| e.id == id && !e.removed)
                    .and_then(|e| e.poll.take().map(|p| (p, e.name.clone())))
            };
            let Some((mut poll, name)) = taken else {
                continue;
            };

            let status = poll();
            if status != SourceStatus::Idle {
                work += 1;
            }

            let mut sources = self.inner.sources.borrow_mut();
            if let Some(entry) = sources.iter_mut().find(|e| e.id == id) {
                if status == SourceStatus::Disable || entry.removed {
                    trace!(source = %name, "Event source disabled");
                    entry.removed = true;
                } else {
                    entry.poll = Some(poll);
                }
            }
            sources.retain(|e| !e.removed);
        }

        work
    }

    /// Dispatch pending work, sleeping up to `timeout` when idle
    pub fn process_events(&self, timeout: Duration) -> usize {
        let work = self.dispatch_pending();
        if work > 0 || !self.inner.posted.borrow().is_empty() {
            return work;
        }

        let wait = timeout.min(timing::LOOP_POLL_INTERVAL);
        if self.inner.wake_rx.recv_timeout(wait).is_ok() {
            while self.inner.wake_rx.try_recv().is_ok() {}
        }
        self.dispatch_pending()
    }

    /// Keep dispatching until `done` returns true or `timeout` elapses
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return done();
            }
            self.process_events(deadline - now);
        }
    }
}
