// SPDX-License-Identifier: GPL-3.0-only

//! Capture requests
//!
//! A request binds at most one [`FrameBuffer`] per [`Stream`] of a single
//! camera, carries controls to apply for that frame and collects metadata.
//!
//! ```text
//!   Pending ──queue──► Queued ──┬──► Complete
//!      ▲                        └──► Cancelled
//!      └────────── reuse() ◄────────────┘
//! ```

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::controls::ControlList;
use super::framebuffer::{BufferId, FrameBuffer, FrameStatus};
use super::stream::{Stream, StreamId};
use crate::errors::{HalError, HalResult};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Queued,
    Complete,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Cancelled)
    }
}

/// How much state `reuse()` keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseFlag {
    /// Drop buffer bindings
    Default,
    /// Keep the same buffers bound
    ReuseBuffers,
}

pub(crate) struct RequestInner {
    id: RequestId,
    camera_id: String,
    cookie: u64,
    status: Cell<RequestStatus>,
    sequence: Cell<u32>,
    buffers: RefCell<BTreeMap<StreamId, (Stream, FrameBuffer)>>,
    pending: RefCell<BTreeSet<BufferId>>,
    controls: RefCell<ControlList>,
    metadata: RefCell<ControlList>,
    error: RefCell<Option<HalError>>,
    cancelled: Cell<bool>,
    ready: Cell<bool>,
}

/// Handle to a capture request
#[derive(Clone)]
pub struct Request {
    inner: Rc<RequestInner>,
}

impl Request {
    pub(crate) fn new(camera_id: &str, cookie: u64) -> Self {
        Self {
            inner: Rc::new(RequestInner {
                id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
                camera_id: camera_id.to_string(),
                cookie,
                status: Cell::new(RequestStatus::Pending),
                sequence: Cell::new(0),
                buffers: RefCell::new(BTreeMap::new()),
                pending: RefCell::new(BTreeSet::new()),
                controls: RefCell::new(ControlList::new()),
                metadata: RefCell::new(ControlList::new()),
                error: RefCell::new(None),
                cancelled: Cell::new(false),
                ready: Cell::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RequestInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    /// Opaque application value
    pub fn cookie(&self) -> u64 {
        self.inner.cookie
    }

    pub fn status(&self) -> RequestStatus {
        self.inner.status.get()
    }

    /// Per-camera completion sequence number
    pub fn sequence(&self) -> u32 {
        self.inner.sequence.get()
    }

    /// Bind a buffer to a stream
    pub fn add_buffer(&self, stream: &Stream, buffer: FrameBuffer) -> HalResult<()> {
        if self.status() != RequestStatus::Pending {
            return Err(HalError::State(format!(
                "{} is not pending, cannot add buffers",
                self.id()
            )));
        }

        if let Some(owner) = buffer.request() {
            if owner.id() != self.id() {
                return Err(HalError::InvalidRequest(format!(
                    "{} already bound to {}",
                    buffer.id(),
                    owner.id()
                )));
            }
        }

        let mut buffers = self.inner.buffers.borrow_mut();
        if buffers.contains_key(&stream.id()) {
            return Err(HalError::InvalidRequest(format!(
                "{} already has a buffer for {}",
                self.id(),
                stream.id()
            )));
        }

        buffer.bind_request(&self.inner);
        self.inner.pending.borrow_mut().insert(buffer.id());
        buffers.insert(stream.id(), (stream.clone(), buffer));
        Ok(())
    }

    pub fn find_buffer(&self, stream: &Stream) -> Option<FrameBuffer> {
        self.inner
            .buffers
            .borrow()
            .get(&stream.id())
            .map(|(_, buffer)| buffer.clone())
    }

    pub fn buffers(&self) -> Vec<(Stream, FrameBuffer)> {
        self.inner.buffers.borrow().values().cloned().collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.buffers.borrow().len()
    }

    pub fn has_pending_buffers(&self) -> bool {
        !self.inner.pending.borrow().is_empty()
    }

    pub fn controls(&self) -> Ref<'_, ControlList> {
        self.inner.controls.borrow()
    }

    pub fn controls_mut(&self) -> RefMut<'_, ControlList> {
        self.inner.controls.borrow_mut()
    }

    pub fn metadata(&self) -> Ref<'_, ControlList> {
        self.inner.metadata.borrow()
    }

    pub fn metadata_mut(&self) -> RefMut<'_, ControlList> {
        self.inner.metadata.borrow_mut()
    }

    /// Failure that caused the request to be cancelled, if any
    pub fn error(&self) -> Option<HalError> {
        self.inner.error.borrow().clone()
    }

    /// Return a terminal request to the pending state
    pub fn reuse(&self, flag: ReuseFlag) -> HalResult<()> {
        let status = self.status();
        if status == RequestStatus::Queued {
            return Err(HalError::State(format!("{} is still queued", self.id())));
        }

        let mut buffers = self.inner.buffers.borrow_mut();
        let mut pending = self.inner.pending.borrow_mut();
        pending.clear();
        match flag {
            ReuseFlag::ReuseBuffers => {
                for (_, buffer) in buffers.values() {
                    buffer.set_metadata(Default::default());
                    pending.insert(buffer.id());
                }
            }
            ReuseFlag::Default => {
                for (_, buffer) in buffers.values() {
                    buffer.unbind_request();
                }
                buffers.clear();
            }
        }

        self.inner.status.set(RequestStatus::Pending);
        self.inner.sequence.set(0);
        self.inner.cancelled.set(false);
        self.inner.ready.set(false);
        *self.inner.error.borrow_mut() = None;
        self.inner.controls.borrow_mut().clear();
        self.inner.metadata.borrow_mut().clear();
        Ok(())
    }

    pub(crate) fn mark_queued(&self) {
        self.inner.status.set(RequestStatus::Queued);
    }

    /// Record a finished buffer; returns whether buffers remain pending
    pub(crate) fn complete_buffer(&self, buffer: &FrameBuffer) -> bool {
        let mut pending = self.inner.pending.borrow_mut();
        pending.remove(&buffer.id());
        if buffer.metadata().status == FrameStatus::Cancelled {
            self.inner.cancelled.set(true);
        }
        !pending.is_empty()
    }

    /// Buffers not yet returned by the hardware
    pub(crate) fn pending_buffers(&self) -> Vec<FrameBuffer> {
        let pending = self.inner.pending.borrow();
        self.inner
            .buffers
            .borrow()
            .values()
            .filter(|(_, buffer)| pending.contains(&buffer.id()))
            .map(|(_, buffer)| buffer.clone())
            .collect()
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.set(true);
    }

    pub(crate) fn set_error(&self, error: HalError) {
        *self.inner.error.borrow_mut() = Some(error);
        self.inner.cancelled.set(true);
    }

    pub(crate) fn set_ready(&self) {
        self.inner.ready.set(true);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.inner.ready.get()
    }

    /// Enter the terminal state
    pub(crate) fn finalize(&self, sequence: u32) {
        for buffer in self.pending_buffers() {
            buffer.cancel();
        }
        if self.has_pending_buffers() {
            self.inner.cancelled.set(true);
            self.inner.pending.borrow_mut().clear();
        }
        self.inner.sequence.set(sequence);
        self.inner.status.set(if self.inner.cancelled.get() {
            RequestStatus::Cancelled
        } else {
            RequestStatus::Complete
        });
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("camera", &self.inner.camera_id)
            .field("cookie", &self.inner.cookie)
            .field("status", &self.inner.status.get())
            .field("buffers", &self.inner.buffers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_buffer() -> (Request, Stream, FrameBuffer) {
        let request = Request::new("cam0", 7);
        let stream = Stream::new("out");
        let buffer = FrameBuffer::allocate(&[64]);
        request.add_buffer(&stream, buffer.clone()).unwrap();
        (request, stream, buffer)
    }

    #[test]
    fn test_add_buffer_binds_back_reference() {
        let (request, stream, buffer) = request_with_buffer();
        assert_eq!(buffer.request(), Some(request.clone()));
        assert_eq!(request.find_buffer(&stream), Some(buffer));
        assert_eq!(request.cookie(), 7);
        assert!(request.has_pending_buffers());
    }

    #[test]
    fn test_duplicate_stream_is_rejected() {
        let (request, stream, _) = request_with_buffer();
        let err = request
            .add_buffer(&stream, FrameBuffer::allocate(&[64]))
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidRequest(_)));
    }

    #[test]
    fn test_buffer_cannot_join_two_requests() {
        let (_request, _, buffer) = request_with_buffer();
        let other = Request::new("cam0", 0);
        assert!(other.add_buffer(&Stream::new("x"), buffer).is_err());
    }

    #[test]
    fn test_finalize_success_and_cancel() {
        let (request, _, buffer) = request_with_buffer();
        request.mark_queued();
        assert!(!request.complete_buffer(&buffer));
        request.finalize(3);
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(request.sequence(), 3);

        let (request, _, buffer) = request_with_buffer();
        request.mark_queued();
        request.finalize(0);
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert_eq!(buffer.metadata().status, FrameStatus::Cancelled);
    }

    #[test]
    fn test_reuse_keeps_buffers_when_asked() {
        let (request, stream, buffer) = request_with_buffer();
        request.mark_queued();
        assert!(request.reuse(ReuseFlag::Default).is_err());

        request.complete_buffer(&buffer);
        request.finalize(0);
        request.reuse(ReuseFlag::ReuseBuffers).unwrap();
        assert_eq!(request.status(), RequestStatus::Pending);
        assert_eq!(request.find_buffer(&stream), Some(buffer.clone()));
        assert!(request.has_pending_buffers());

        request.reuse(ReuseFlag::Default).unwrap();
        assert_eq!(request.buffer_count(), 0);
        assert!(buffer.request().is_none());
    }
}
