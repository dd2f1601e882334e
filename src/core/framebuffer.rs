// SPDX-License-Identifier: GPL-3.0-only

//! Frame buffers
//!
//! A [`FrameBuffer`] is a cheap handle over one or more planes of shared
//! memory. Plane memory is `Send` so the algorithm worker thread can map
//! the same storage; the handle itself stays on the event loop thread.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::request::{Request, RequestInner};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Shared plane storage
pub type PlaneMemory = Arc<RwLock<Vec<u8>>>;

/// One plane of a frame buffer
#[derive(Debug, Clone)]
pub struct Plane {
    pub memory: PlaneMemory,
    pub length: usize,
}

impl Plane {
    pub fn allocate(length: usize) -> Self {
        Self {
            memory: Arc::new(RwLock::new(vec![0; length])),
            length,
        }
    }
}

/// Outcome of a single buffer use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Success,
    Error,
    Cancelled,
}

/// Per-use metadata filled by the producer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub status: FrameStatus,
    pub sequence: u32,
    /// Nanoseconds, monotonic clock
    pub timestamp: u64,
    /// Bytes used per plane
    pub bytes_used: Vec<u32>,
}

struct FrameBufferInner {
    id: BufferId,
    planes: Vec<Plane>,
    metadata: RefCell<FrameMetadata>,
    request: RefCell<Weak<RequestInner>>,
}

/// Handle to a frame buffer
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Rc<FrameBufferInner>,
}

impl FrameBuffer {
    pub fn new(planes: Vec<Plane>) -> Self {
        Self {
            inner: Rc::new(FrameBufferInner {
                id: BufferId::next(),
                planes,
                metadata: RefCell::new(FrameMetadata::default()),
                request: RefCell::new(Weak::new()),
            }),
        }
    }

    /// Allocate zeroed planes of the given sizes
    pub fn allocate(plane_sizes: &[usize]) -> Self {
        Self::new(plane_sizes.iter().map(|&len| Plane::allocate(len)).collect())
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    pub fn metadata(&self) -> Ref<'_, FrameMetadata> {
        self.inner.metadata.borrow()
    }

    pub fn set_metadata(&self, metadata: FrameMetadata) {
        *self.inner.metadata.borrow_mut() = metadata;
    }

    /// Mark the buffer as returned without valid data
    pub fn cancel(&self) {
        self.inner.metadata.borrow_mut().status = FrameStatus::Cancelled;
    }

    /// Request this buffer is currently bound to
    pub fn request(&self) -> Option<Request> {
        self.inner.request.borrow().upgrade().map(Request::from_inner)
    }

    pub(crate) fn bind_request(&self, request: &Rc<RequestInner>) {
        *self.inner.request.borrow_mut() = Rc::downgrade(request);
    }

    pub(crate) fn unbind_request(&self) {
        *self.inner.request.borrow_mut() = Weak::new();
    }

    /// Fill every plane with a constant byte and record bytes used
    pub fn fill(&self, value: u8) {
        let mut used = Vec::with_capacity(self.inner.planes.len());
        for plane in &self.inner.planes {
            if let Ok(mut data) = plane.memory.write() {
                data.iter_mut().for_each(|b| *b = value);
            }
            used.push(plane.length as u32);
        }
        self.inner.metadata.borrow_mut().bytes_used = used;
    }
}

impl PartialEq for FrameBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for FrameBuffer {}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.inner.id)
            .field("planes", &self.inner.planes.len())
            .field("status", &self.inner.metadata.borrow().status)
            .finish()
    }
}
