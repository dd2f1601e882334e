// SPDX-License-Identifier: GPL-3.0-only

//! Camera device façade and lifecycle state machine
//!
//! ```text
//!   Available ──acquire──► Acquired ──configure──► Configured ──start──► Running
//!       ▲                     │ ▲                     │  ▲                 │
//!       └──────release────────┘ └─────configure───────┘  └──────stop───────┘
//!       ▲                                             │
//!       └────────────────────release──────────────────┘
//!
//!   any state ──hardware removal──► Disconnected (terminal)
//! ```
//!
//! Transitions are non-reentrant: a transition started from a callback of
//! another transition of the same camera fails with a state error.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use super::controls::{ControlInfoMap, ControlList};
use super::framebuffer::FrameBuffer;
use super::request::{Request, RequestStatus};
use super::stream::{CameraConfiguration, ConfigStatus, Stream, StreamId, StreamRole};
use crate::errors::{HalError, HalResult};
use crate::pipeline::PipelineHandler;
use crate::signal::Signal;

/// Camera lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Available,
    Acquired,
    Configured,
    Running,
    Disconnected,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Available => "Available",
            CameraState::Acquired => "Acquired",
            CameraState::Configured => "Configured",
            CameraState::Running => "Running",
            CameraState::Disconnected => "Disconnected",
        };
        write!(f, "{}", name)
    }
}

pub(crate) struct CameraInner {
    id: String,
    pipe: Rc<PipelineHandler>,
    streams: Vec<Stream>,
    state: Cell<CameraState>,
    busy: Cell<bool>,
    active_streams: RefCell<BTreeSet<StreamId>>,
    buffer_completed: Signal<(Request, FrameBuffer)>,
    request_completed: Signal<Request>,
    disconnected: Signal<String>,
}

/// Handle to a camera device
#[derive(Clone)]
pub struct Camera {
    inner: Rc<CameraInner>,
}

/// Non-owning camera reference held by the pipeline handler
#[derive(Clone)]
pub(crate) struct WeakCamera(Weak<CameraInner>);

impl WeakCamera {
    pub(crate) fn upgrade(&self) -> Option<Camera> {
        self.0.upgrade().map(|inner| Camera { inner })
    }
}

/// Clears the busy flag when a transition ends
struct Transition<'a> {
    busy: &'a Cell<bool>,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.busy.set(false);
    }
}

impl Camera {
    pub(crate) fn new(id: String, pipe: Rc<PipelineHandler>, streams: Vec<Stream>) -> Self {
        Self {
            inner: Rc::new(CameraInner {
                id,
                pipe,
                streams,
                state: Cell::new(CameraState::Available),
                busy: Cell::new(false),
                active_streams: RefCell::new(BTreeSet::new()),
                buffer_completed: Signal::new(),
                request_completed: Signal::new(),
                disconnected: Signal::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCamera {
        WeakCamera(Rc::downgrade(&self.inner))
    }

    pub(crate) fn pipe(&self) -> &Rc<PipelineHandler> {
        &self.inner.pipe
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> CameraState {
        self.inner.state.get()
    }

    /// All streams the camera can produce
    pub fn streams(&self) -> &[Stream] {
        &self.inner.streams
    }

    /// Streams bound by the last successful configure
    pub fn active_streams(&self) -> Vec<Stream> {
        let active = self.inner.active_streams.borrow();
        self.inner
            .streams
            .iter()
            .filter(|s| active.contains(&s.id()))
            .cloned()
            .collect()
    }

    pub(crate) fn is_stream_active(&self, stream: &Stream) -> bool {
        self.inner.active_streams.borrow().contains(&stream.id())
    }

    /// Controls accepted in requests
    pub fn controls(&self) -> ControlInfoMap {
        self.inner.pipe.controls(self.id())
    }

    /// Static camera properties
    pub fn properties(&self) -> ControlList {
        self.inner.pipe.properties(self.id())
    }

    /// Emitted for every buffer completion, before its request completes
    pub fn buffer_completed(&self) -> &Signal<(Request, FrameBuffer)> {
        &self.inner.buffer_completed
    }

    /// Emitted exactly once per queued request, in submission order
    pub fn request_completed(&self) -> &Signal<Request> {
        &self.inner.request_completed
    }

    /// Emitted once when the hardware goes away
    pub fn disconnected(&self) -> &Signal<String> {
        &self.inner.disconnected
    }

    /// Requests queued and not yet completed
    pub fn queued_requests(&self) -> usize {
        self.inner.pipe.queued_requests(self.id())
    }

    /// Sequence number the next completed request will carry
    pub fn next_sequence(&self) -> u32 {
        self.inner.pipe.request_sequence(self.id())
    }

    fn ensure_connected(&self) -> HalResult<()> {
        if self.state() == CameraState::Disconnected {
            return Err(HalError::Disconnected(self.inner.id.clone()));
        }
        Ok(())
    }

    fn begin_transition(&self, op: &str, allowed: &[CameraState]) -> HalResult<Transition<'_>> {
        self.ensure_connected()?;
        if self.inner.busy.get() {
            return Err(HalError::State(format!(
                "{}: {} while another transition is in progress",
                self.inner.id, op
            )));
        }
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(HalError::State(format!(
                "{}: {} not allowed in state {}",
                self.inner.id, op, state
            )));
        }
        self.inner.busy.set(true);
        Ok(Transition {
            busy: &self.inner.busy,
        })
    }

    fn set_state(&self, state: CameraState) {
        debug!(camera = %self.inner.id, from = %self.state(), to = %state, "Camera state change");
        self.inner.state.set(state);
    }

    /// Gain exclusive access to the camera
    pub fn acquire(&self) -> HalResult<()> {
        self.ensure_connected()?;
        if self.state() != CameraState::Available {
            return Err(HalError::Resource(format!(
                "{} is already acquired",
                self.inner.id
            )));
        }
        let _guard = self.begin_transition("acquire", &[CameraState::Available])?;

        if !self.inner.pipe.lock() {
            return Err(HalError::Resource(format!(
                "pipeline handler of {} is in use by another process",
                self.inner.id
            )));
        }

        self.set_state(CameraState::Acquired);
        info!(camera = %self.inner.id, "Camera acquired");
        Ok(())
    }

    /// Give up exclusive access; a no-op if not acquired
    pub fn release(&self) -> HalResult<()> {
        self.ensure_connected()?;
        if self.state() == CameraState::Available {
            return Ok(());
        }
        let _guard = self.begin_transition(
            "release",
            &[CameraState::Acquired, CameraState::Configured],
        )?;

        for stream in &self.inner.streams {
            stream.set_configuration(None);
        }
        self.inner.active_streams.borrow_mut().clear();
        self.inner.pipe.unlock();

        self.set_state(CameraState::Available);
        info!(camera = %self.inner.id, "Camera released");
        Ok(())
    }

    /// Default configuration for the requested roles
    pub fn generate_configuration(&self, roles: &[StreamRole]) -> HalResult<CameraConfiguration> {
        self.ensure_connected()?;
        let config = self.inner.pipe.generate_configuration(self.id(), roles)?;
        debug!(camera = %self.inner.id, ?roles, entries = config.len(), "Generated configuration");
        Ok(config)
    }

    /// Validate and apply a configuration
    pub fn configure(&self, config: &mut CameraConfiguration) -> HalResult<()> {
        let _guard = self.begin_transition(
            "configure",
            &[CameraState::Acquired, CameraState::Configured],
        )?;

        if config.is_empty() {
            return Err(HalError::Configuration(
                "configuration has no stream entries".to_string(),
            ));
        }

        match config.validate() {
            ConfigStatus::Invalid => {
                return Err(HalError::Configuration(format!(
                    "{}: configuration is invalid",
                    self.inner.id
                )));
            }
            ConfigStatus::Adjusted => {
                info!(camera = %self.inner.id, "Configuration adjusted");
            }
            ConfigStatus::Valid => {}
        }

        self.inner.pipe.configure(self.id(), config)?;

        let mut bound = Vec::with_capacity(config.len());
        for entry in config.entries() {
            let Some(stream) = entry.stream() else {
                return Err(HalError::Configuration(format!(
                    "{}: backend left entry {} without a stream",
                    self.inner.id, entry
                )));
            };
            bound.push((stream.clone(), entry.clone()));
        }

        let mut active = self.inner.active_streams.borrow_mut();
        active.clear();
        for (stream, entry) in bound {
            info!(camera = %self.inner.id, stream = %stream.id(), config = %entry, "Stream configured");
            active.insert(stream.id());
            stream.set_configuration(Some(entry));
        }
        drop(active);

        self.set_state(CameraState::Configured);
        Ok(())
    }

    /// Create an empty request owned by this camera
    pub fn create_request(&self, cookie: u64) -> HalResult<Request> {
        self.ensure_connected()?;
        match self.state() {
            CameraState::Configured | CameraState::Running => Ok(Request::new(self.id(), cookie)),
            state => Err(HalError::State(format!(
                "{}: cannot create requests in state {}",
                self.inner.id, state
            ))),
        }
    }

    /// Submit a request for capture
    pub fn queue_request(&self, request: &Request) -> HalResult<()> {
        self.ensure_connected()?;
        if self.state() != CameraState::Running {
            return Err(HalError::State(format!(
                "{}: cannot queue requests in state {}",
                self.inner.id,
                self.state()
            )));
        }

        if request.camera_id() != self.id() {
            return Err(HalError::InvalidRequest(format!(
                "{} belongs to camera {}",
                request.id(),
                request.camera_id()
            )));
        }
        if request.status() != RequestStatus::Pending {
            return Err(HalError::InvalidRequest(format!(
                "{} is not pending",
                request.id()
            )));
        }
        let buffers = request.buffers();
        if buffers.is_empty() {
            return Err(HalError::InvalidRequest(format!(
                "{} has no buffers",
                request.id()
            )));
        }
        for (stream, _) in &buffers {
            if !self.is_stream_active(stream) {
                return Err(HalError::InvalidRequest(format!(
                    "{} references {} which is not configured",
                    request.id(),
                    stream.id()
                )));
            }
        }

        self.inner.pipe.queue_request(request)
    }

    /// Start capturing with optional initial controls
    pub fn start(&self, controls: Option<&ControlList>) -> HalResult<()> {
        let _guard = self.begin_transition("start", &[CameraState::Configured])?;
        self.inner.pipe.start(self.id(), controls)?;
        self.set_state(CameraState::Running);
        info!(camera = %self.inner.id, "Camera started");
        Ok(())
    }

    /// Stop capturing; every queued request completes before this returns
    pub fn stop(&self) -> HalResult<()> {
        self.ensure_connected()?;
        if self.state() != CameraState::Running && !self.inner.busy.get() {
            return Ok(());
        }
        let _guard = self.begin_transition("stop", &[CameraState::Running])?;

        // Requests completed while draining must not be able to re-queue
        self.set_state(CameraState::Configured);
        self.inner.pipe.stop(self.id());
        info!(camera = %self.inner.id, "Camera stopped");
        Ok(())
    }

    /// Enter the terminal state; the pipeline drains requests afterwards
    pub(crate) fn mark_disconnected(&self) {
        if self.state() != CameraState::Disconnected {
            warn!(camera = %self.inner.id, "Camera disconnected");
            self.inner.state.set(CameraState::Disconnected);
        }
    }

    pub(crate) fn emit_disconnected(&self) {
        self.inner.disconnected.emit(&self.inner.id);
    }
}

impl PartialEq for Camera {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("streams", &self.inner.streams.len())
            .finish()
    }
}
