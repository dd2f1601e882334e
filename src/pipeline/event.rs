// SPDX-License-Identifier: GPL-3.0-only

//! Hardware notifications and deferred completions
//!
//! Devices never call into a pipeline handler directly. They post a
//! [`DeviceEvent`] through an [`EventSink`], which defers delivery to the
//! event loop. Backends answer events by recording [`Completion`]s in a
//! [`Completer`]; the handler applies them once the backend is no longer
//! borrowed, so application callbacks can re-enter the camera API.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::core::framebuffer::FrameBuffer;
use crate::core::request::Request;
use crate::event_loop::EventLoop;
use crate::ipa::IpaNotification;

/// Asynchronous notification from hardware or the algorithm worker
pub enum DeviceEvent {
    /// A video node finished with a buffer
    BufferReady { node: String, buffer: FrameBuffer },
    /// Start of exposure of a new frame
    FrameStart { node: String, sequence: u32 },
    /// Message from the algorithm worker
    Ipa(IpaNotification),
    /// An internal buffer pool has capacity again
    BufferAvailable,
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::BufferReady { node, buffer } => f
                .debug_struct("BufferReady")
                .field("node", node)
                .field("buffer", &buffer.id())
                .finish(),
            DeviceEvent::FrameStart { node, sequence } => f
                .debug_struct("FrameStart")
                .field("node", node)
                .field("sequence", sequence)
                .finish(),
            DeviceEvent::Ipa(n) => f.debug_tuple("Ipa").field(n).finish(),
            DeviceEvent::BufferAvailable => write!(f, "BufferAvailable"),
        }
    }
}

/// Posts device events to the event loop for later delivery
///
/// Every sink belongs to a scope, normally one camera. Invalidating a scope
/// drops the undelivered events of that scope only.
#[derive(Clone)]
pub struct EventSink {
    event_loop: EventLoop,
    deliver: Rc<dyn Fn(DeviceEvent)>,
    epochs: Rc<RefCell<BTreeMap<String, u64>>>,
    scope: Rc<str>,
}

impl EventSink {
    pub fn new(event_loop: &EventLoop, deliver: impl Fn(DeviceEvent) + 'static) -> Self {
        Self {
            event_loop: event_loop.clone(),
            deliver: Rc::new(deliver),
            epochs: Rc::new(RefCell::new(BTreeMap::new())),
            scope: Rc::from(""),
        }
    }

    /// A sink sharing this delivery route whose events are invalidated
    /// independently
    pub fn scoped(&self, scope: &str) -> Self {
        Self {
            scope: Rc::from(scope),
            ..self.clone()
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn epoch(&self, scope: &str) -> u64 {
        self.epochs.borrow().get(scope).copied().unwrap_or(0)
    }

    pub fn post(&self, event: DeviceEvent) {
        let sink = self.clone();
        let posted_in = self.epoch(&self.scope);
        self.event_loop.post(move || {
            if sink.epoch(&sink.scope) == posted_in {
                (sink.deliver)(event);
            } else {
                trace!(scope = %sink.scope, ?event, "Dropping event posted before the pipeline stopped");
            }
        });
    }

    /// Drop every event of this sink's scope not delivered yet
    pub fn invalidate(&self) {
        self.invalidate_scope(&self.scope);
    }

    /// Drop every undelivered event posted through a sink of `scope`
    pub fn invalidate_scope(&self, scope: &str) {
        let mut epochs = self.epochs.borrow_mut();
        let epoch = epochs.entry(scope.to_string()).or_insert(0);
        *epoch = epoch.wrapping_add(1);
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

/// One deferred completion
#[derive(Debug, Clone)]
pub enum Completion {
    Buffer { request: Request, buffer: FrameBuffer },
    Request(Request),
    /// Cancel the request's pending buffers, then complete it
    Cancel(Request),
}

/// Completions recorded by a backend while it handles a call or event
#[derive(Debug, Default)]
pub struct Completer {
    completions: Vec<Completion>,
}

impl Completer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete_buffer(&mut self, request: &Request, buffer: &FrameBuffer) {
        self.completions.push(Completion::Buffer {
            request: request.clone(),
            buffer: buffer.clone(),
        });
    }

    pub fn complete_request(&mut self, request: &Request) {
        self.completions.push(Completion::Request(request.clone()));
    }

    pub fn cancel_request(&mut self, request: &Request) {
        self.completions.push(Completion::Cancel(request.clone()));
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub(crate) fn take(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}
