// SPDX-License-Identifier: GPL-3.0-only

//! Generic pipeline orchestration
//!
//! [`PipelineHandler`] owns everything that is the same for all hardware
//! families: per-camera state, the request FIFO, completion ordering,
//! draining and hardware locking. Hardware specifics live behind the
//! [`PipelineBackend`] trait.
//!
//! ```text
//!   Camera::queue_request
//!        │
//!        ▼
//!   PipelineHandler ── FIFO push ──► backend.queue_request_device()
//!        ▲                                   │
//!        │ Completer (applied after borrow)  ▼
//!   backend.handle_event() ◄── EventSink ◄── hardware / IPA
//!        │
//!        ▼
//!   complete_buffer ──► buffer_completed
//!   complete_request ─► FIFO head ready? ──► request_completed (in order)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, info, trace, warn};

use super::event::{Completer, Completion, DeviceEvent, EventSink};
use crate::config::Config;
use crate::core::camera::{Camera, CameraState, WeakCamera};
use crate::core::controls::{ControlInfoMap, ControlList};
use crate::core::device::{DeviceEnumerator, MediaDevice};
use crate::core::framebuffer::FrameBuffer;
use crate::core::request::{Request, RequestStatus};
use crate::core::stream::{CameraConfiguration, Stream, StreamRole};
use crate::errors::{HalError, HalResult};
use crate::event_loop::EventLoop;

/// Everything a backend needs while matching devices
pub struct MatchContext<'a> {
    pub enumerator: &'a DeviceEnumerator,
    pub event_loop: &'a EventLoop,
    /// Route for hardware notifications back to this pipeline
    pub sink: EventSink,
    pub config: &'a Config,
}

/// A camera discovered by a backend
pub struct CameraInfo {
    pub id: String,
    pub streams: Vec<Stream>,
    pub controls: ControlInfoMap,
    pub properties: ControlList,
}

/// Devices claimed and cameras found by a successful match
pub struct MatchResult {
    pub media_devices: Vec<Rc<MediaDevice>>,
    pub cameras: Vec<CameraInfo>,
}

/// Hardware-family specific half of a pipeline handler
///
/// Backends never call back into the handler. Anything that completes
/// buffers or requests is recorded in the [`Completer`] passed in.
pub trait PipelineBackend {
    fn name(&self) -> &'static str;

    /// Claim devices and describe their cameras; `None` when nothing matched
    fn match_devices(&mut self, ctx: &MatchContext<'_>) -> HalResult<Option<MatchResult>>;

    fn generate_configuration(
        &mut self,
        camera: &str,
        roles: &[StreamRole],
    ) -> HalResult<CameraConfiguration>;

    /// Apply a validated configuration and bind a stream to every entry
    fn configure(&mut self, camera: &str, config: &mut CameraConfiguration) -> HalResult<()>;

    fn export_frame_buffers(&mut self, camera: &str, stream: &Stream) -> HalResult<Vec<FrameBuffer>>;

    fn start(&mut self, camera: &str, controls: Option<&ControlList>) -> HalResult<()>;

    /// Stop the hardware and forget every in-flight request
    fn stop(&mut self, camera: &str, completer: &mut Completer);

    /// Hand a request to the hardware
    fn queue_request_device(
        &mut self,
        camera: &str,
        request: &Request,
        completer: &mut Completer,
    ) -> HalResult<()>;

    fn handle_event(&mut self, event: DeviceEvent, completer: &mut Completer);
}

struct CameraData {
    camera: WeakCamera,
    queue: VecDeque<Request>,
    sequence: u32,
    /// Set while completed requests of this camera are being signalled
    flushing: bool,
    controls: ControlInfoMap,
    properties: ControlList,
}

/// Orchestrates cameras of one backend instance
pub struct PipelineHandler {
    name: &'static str,
    event_loop: EventLoop,
    backend: RefCell<Box<dyn PipelineBackend>>,
    sink: RefCell<Option<EventSink>>,
    media_devices: RefCell<Vec<Rc<MediaDevice>>>,
    use_count: Cell<u32>,
    cameras: RefCell<BTreeMap<String, CameraData>>,
    disconnected: Cell<bool>,
}

impl PipelineHandler {
    pub fn new(backend: Box<dyn PipelineBackend>, event_loop: &EventLoop) -> Rc<Self> {
        Rc::new(Self {
            name: backend.name(),
            event_loop: event_loop.clone(),
            backend: RefCell::new(backend),
            sink: RefCell::new(None),
            media_devices: RefCell::new(Vec::new()),
            use_count: Cell::new(0),
            cameras: RefCell::new(BTreeMap::new()),
            disconnected: Cell::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Let the backend claim devices and register the cameras it found
    pub fn match_devices(
        self: &Rc<Self>,
        enumerator: &DeviceEnumerator,
        config: &Config,
    ) -> Vec<Camera> {
        let weak: Weak<Self> = Rc::downgrade(self);
        let sink = EventSink::new(&self.event_loop, move |event| {
            if let Some(handler) = weak.upgrade() {
                handler.handle_event(event);
            }
        });
        *self.sink.borrow_mut() = Some(sink.clone());
        let ctx = MatchContext {
            enumerator,
            event_loop: &self.event_loop,
            sink,
            config,
        };

        let result = self.backend.borrow_mut().match_devices(&ctx);
        let result = match result {
            Ok(Some(result)) => result,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(pipeline = self.name, %err, "Device match failed");
                return Vec::new();
            }
        };

        *self.media_devices.borrow_mut() = result.media_devices;

        let mut cameras = Vec::with_capacity(result.cameras.len());
        for info in result.cameras {
            let camera = Camera::new(info.id.clone(), self.clone(), info.streams);
            self.cameras.borrow_mut().insert(
                info.id,
                CameraData {
                    camera: camera.downgrade(),
                    queue: VecDeque::new(),
                    sequence: 0,
                    flushing: false,
                    controls: info.controls,
                    properties: info.properties,
                },
            );
            info!(pipeline = self.name, camera = %camera.id(), "Camera registered");
            cameras.push(camera);
        }
        cameras
    }

    /// Whether this handler claimed the given media device
    pub fn owns_device(&self, device: &Rc<MediaDevice>) -> bool {
        self.media_devices
            .borrow()
            .iter()
            .any(|d| Rc::ptr_eq(d, device))
    }

    pub fn cameras(&self) -> Vec<Camera> {
        self.cameras
            .borrow()
            .values()
            .filter_map(|d| d.camera.upgrade())
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.get()
    }

    /// Take exclusive ownership of every media device, all or nothing
    pub(crate) fn lock(&self) -> bool {
        if self.use_count.get() == 0 {
            let devices = self.media_devices.borrow();
            for (i, device) in devices.iter().enumerate() {
                if !device.lock() {
                    warn!(pipeline = self.name, model = %device.model(), "Media device is locked");
                    for locked in &devices[..i] {
                        locked.unlock();
                    }
                    return false;
                }
            }
        }
        self.use_count.set(self.use_count.get() + 1);
        true
    }

    pub(crate) fn unlock(&self) {
        let count = self.use_count.get();
        if count == 0 {
            return;
        }
        self.use_count.set(count - 1);
        if count == 1 {
            for device in self.media_devices.borrow().iter() {
                device.unlock();
            }
        }
    }

    pub(crate) fn controls(&self, camera_id: &str) -> ControlInfoMap {
        self.cameras
            .borrow()
            .get(camera_id)
            .map(|d| d.controls.clone())
            .unwrap_or_default()
    }

    pub(crate) fn properties(&self, camera_id: &str) -> ControlList {
        self.cameras
            .borrow()
            .get(camera_id)
            .map(|d| d.properties.clone())
            .unwrap_or_default()
    }

    /// Requests queued and not yet signalled
    pub(crate) fn queued_requests(&self, camera_id: &str) -> usize {
        self.cameras
            .borrow()
            .get(camera_id)
            .map(|d| d.queue.len())
            .unwrap_or(0)
    }

    /// Sequence number the next completed request will get
    pub(crate) fn request_sequence(&self, camera_id: &str) -> u32 {
        self.cameras
            .borrow()
            .get(camera_id)
            .map(|d| d.sequence)
            .unwrap_or(0)
    }

    fn ensure_camera(&self, camera_id: &str) -> HalResult<()> {
        if self.cameras.borrow().contains_key(camera_id) {
            Ok(())
        } else {
            Err(HalError::NotFound(format!("camera {}", camera_id)))
        }
    }

    fn camera(&self, camera_id: &str) -> Option<Camera> {
        self.cameras
            .borrow()
            .get(camera_id)
            .and_then(|d| d.camera.upgrade())
    }

    /// Run a backend call, then apply whatever it completed
    fn with_backend<R>(
        &self,
        call: impl FnOnce(&mut dyn PipelineBackend, &mut Completer) -> R,
    ) -> R {
        let mut completer = Completer::new();
        let result = {
            let mut backend = self.backend.borrow_mut();
            call(backend.as_mut(), &mut completer)
        };
        self.apply(completer);
        result
    }

    fn apply(&self, mut completer: Completer) {
        for completion in completer.take() {
            match completion {
                Completion::Buffer { request, buffer } => {
                    self.complete_buffer(&request, &buffer);
                }
                Completion::Request(request) => self.complete_request(&request),
                Completion::Cancel(request) => self.cancel_request(&request),
            }
        }
    }

    pub(crate) fn generate_configuration(
        &self,
        camera_id: &str,
        roles: &[StreamRole],
    ) -> HalResult<CameraConfiguration> {
        self.ensure_camera(camera_id)?;
        self.backend
            .borrow_mut()
            .generate_configuration(camera_id, roles)
    }

    pub(crate) fn configure(
        &self,
        camera_id: &str,
        config: &mut CameraConfiguration,
    ) -> HalResult<()> {
        self.ensure_camera(camera_id)?;
        self.backend.borrow_mut().configure(camera_id, config)
    }

    pub(crate) fn export_frame_buffers(
        &self,
        camera_id: &str,
        stream: &Stream,
    ) -> HalResult<Vec<FrameBuffer>> {
        self.ensure_camera(camera_id)?;
        self.backend
            .borrow_mut()
            .export_frame_buffers(camera_id, stream)
    }

    pub(crate) fn start(&self, camera_id: &str, controls: Option<&ControlList>) -> HalResult<()> {
        self.ensure_camera(camera_id)?;
        self.backend.borrow_mut().start(camera_id, controls)
    }

    /// Cancel every tracked request in FIFO order, then stop the hardware
    ///
    /// Device events of this camera still in flight are discarded so they
    /// cannot touch buffers of a later capture session.
    pub(crate) fn stop(&self, camera_id: &str) {
        self.drain(camera_id);
        self.with_backend(|backend, completer| backend.stop(camera_id, completer));
        if let Some(sink) = self.sink.borrow().as_ref() {
            sink.invalidate_scope(camera_id);
        }
        debug!(pipeline = self.name, camera = camera_id, "Pipeline stopped");
    }

    /// Track a request and hand it to the backend
    ///
    /// A synchronous backend failure cancels only this request; it still
    /// completes in submission order.
    pub(crate) fn queue_request(&self, request: &Request) -> HalResult<()> {
        let camera_id = request.camera_id().to_string();
        {
            let mut cameras = self.cameras.borrow_mut();
            let data = cameras
                .get_mut(&camera_id)
                .ok_or_else(|| HalError::NotFound(format!("camera {}", camera_id)))?;
            request.mark_queued();
            data.queue.push_back(request.clone());
        }
        trace!(pipeline = self.name, camera = %camera_id, request = %request.id(), "Request queued");

        let result = self.with_backend(|backend, completer| {
            backend.queue_request_device(&camera_id, request, completer)
        });
        if let Err(err) = result {
            warn!(
                pipeline = self.name,
                camera = %camera_id,
                request = %request.id(),
                %err,
                "Failed to queue request to device"
            );
            request.set_error(err);
            self.cancel_request(request);
        }
        Ok(())
    }

    /// Mark one buffer of a request done
    ///
    /// Returns whether the request still has buffers pending. Ignored for
    /// requests that already reached a terminal state.
    pub fn complete_buffer(&self, request: &Request, buffer: &FrameBuffer) -> bool {
        if request.status() != RequestStatus::Queued {
            trace!(request = %request.id(), buffer = %buffer.id(), "Ignoring completion of inactive request");
            return false;
        }

        let pending = request.complete_buffer(buffer);
        if let Some(camera) = self.camera(request.camera_id()) {
            camera
                .buffer_completed()
                .emit(&(request.clone(), buffer.clone()));
        }
        pending
    }

    /// Mark a request done; signals every ready request at the FIFO head
    pub fn complete_request(&self, request: &Request) {
        if request.status() != RequestStatus::Queued {
            return;
        }
        request.set_ready();
        self.flush_completed(request.camera_id());
    }

    fn cancel_request(&self, request: &Request) {
        for buffer in request.pending_buffers() {
            buffer.cancel();
            self.complete_buffer(request, &buffer);
        }
        request.cancel();
        self.complete_request(request);
    }

    fn flush_completed(&self, camera_id: &str) {
        // A completion signalled from inside this loop is picked up by it
        {
            let mut cameras = self.cameras.borrow_mut();
            let Some(data) = cameras.get_mut(camera_id) else {
                return;
            };
            if std::mem::replace(&mut data.flushing, true) {
                return;
            }
        }

        loop {
            let next = {
                let mut cameras = self.cameras.borrow_mut();
                let Some(data) = cameras.get_mut(camera_id) else {
                    break;
                };
                if !data.queue.front().is_some_and(|head| head.is_ready()) {
                    break;
                }
                data.queue.pop_front().map(|request| {
                    request.finalize(data.sequence);
                    data.sequence = data.sequence.wrapping_add(1);
                    (request, data.camera.upgrade())
                })
            };
            let Some((request, camera)) = next else {
                break;
            };

            debug!(
                camera = camera_id,
                request = %request.id(),
                sequence = request.sequence(),
                status = ?request.status(),
                "Request completed"
            );
            if let Some(camera) = camera {
                camera.request_completed().emit(&request);
            }
        }

        if let Some(data) = self.cameras.borrow_mut().get_mut(camera_id) {
            data.flushing = false;
        }
    }

    fn drain(&self, camera_id: &str) {
        let queued: Vec<Request> = self
            .cameras
            .borrow()
            .get(camera_id)
            .map(|d| d.queue.iter().cloned().collect())
            .unwrap_or_default();
        if !queued.is_empty() {
            debug!(camera = camera_id, count = queued.len(), "Cancelling queued requests");
        }
        for request in &queued {
            self.cancel_request(request);
        }
    }

    /// Deliver a device event to the backend
    pub fn handle_event(&self, event: DeviceEvent) {
        if self.disconnected.get() {
            trace!(pipeline = self.name, ?event, "Dropping event for disconnected pipeline");
            return;
        }
        self.with_backend(|backend, completer| backend.handle_event(event, completer));
    }

    /// Tear down after hardware removal
    ///
    /// Every camera becomes unusable, its requests are cancelled and its
    /// `disconnected` signal fires.
    pub fn disconnect(&self) {
        if self.disconnected.get() {
            return;
        }

        let ids: Vec<String> = self.cameras.borrow().keys().cloned().collect();
        for id in ids {
            let camera = self.camera(&id);
            let was_running = camera
                .as_ref()
                .is_some_and(|c| c.state() == CameraState::Running);
            if let Some(camera) = &camera {
                camera.mark_disconnected();
            }

            self.drain(&id);
            if was_running {
                self.with_backend(|backend, completer| backend.stop(&id, completer));
            }
            if let Some(camera) = camera {
                camera.emit_disconnected();
            }
        }

        self.disconnected.set(true);
        self.use_count.set(0);
        for device in self.media_devices.borrow().iter() {
            device.unlock();
        }
        info!(pipeline = self.name, "Pipeline disconnected");
    }
}
