// SPDX-License-Identifier: GPL-3.0-only

//! ISP pipeline with auto exposure
//!
//! Every frame uses three buffers: the application's output buffer on the
//! main path, a parameter buffer the algorithm fills before the frame and a
//! statistics buffer the ISP fills during it. Parameter and statistics
//! buffers come from internal pools; the [`FrameTracker`] joins them.
//!
//! ```text
//!   queue_request ─► tracker.create ─► IPA QueueRequest
//!                                          │
//!                      ParamFilled ◄───────┘
//!                          │ queue params, stats, output
//!                          ▼
//!   params dequeued ──► param_dequeued ──────────┐
//!   stats dequeued  ──► IPA SignalStatBuffer     ├──► request complete
//!                          └─► Metadata ─────────┤
//!   output dequeued ─────────────────────────────┘
//!
//!   IPA V4l2Set(frame) ─► held until frame start ─► sensor controls
//! ```
//!
//! Requests arriving while a pool is empty are parked and retried in order
//! whenever a frame returns its buffers.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, trace, warn};

use super::size_property;
use crate::config::Config;
use crate::constants::isp::{self, DEFAULT_SIZE, MAX_SIZE, MIN_SIZE, OUTPUT_BUFFER_COUNT};
use crate::core::controls::{ControlInfo, ControlInfoMap, ControlList, ids};
use crate::core::device::{DeviceMatch, EntityFunction, MediaDevice};
use crate::core::framebuffer::{FrameBuffer, FrameStatus};
use crate::core::request::Request;
use crate::core::stream::{
    CameraConfiguration, ConfigStatus, ConfigValidator, PixelFormat, SizeRange, Stream,
    StreamConfiguration, StreamFormats, StreamRole, Transform,
};
use crate::errors::{HalError, HalResult};
use crate::event_loop::{EventLoop, SourceId, SourceStatus};
use crate::ipa::{
    BasicAe, EntityControls, IpaAction, IpaBuffer, IpaEvent, IpaNotification, IpaProxy,
    IpaSensorInfo,
};
use crate::pipeline::{
    CameraInfo, Completer, DeviceEvent, FrameTracker, MatchContext, MatchResult, PipelineBackend,
};
use crate::signal::Subscription;
use crate::v4l2::{SetOutcome, V4l2Device, VideoFormat, VideoNode};

pub const NAME: &str = "rkisp1";

const FORMATS: [PixelFormat; 2] = [PixelFormat::NV12, PixelFormat::YUYV];
const SIZE_ALIGN: u32 = 2;

/// Adjusts configurations to what the main path can produce
#[derive(Debug, Default)]
pub struct IspValidator;

impl ConfigValidator for IspValidator {
    fn validate(&self, config: &mut CameraConfiguration) -> ConfigStatus {
        if config.is_empty() {
            return ConfigStatus::Invalid;
        }

        let mut status = ConfigStatus::Valid;
        if config.transform != Transform::Identity {
            config.transform = Transform::Identity;
            status = ConfigStatus::Adjusted;
        }
        if config.len() > 1 {
            config.entries_mut().truncate(1);
            status = ConfigStatus::Adjusted;
        }

        let Some(cfg) = config.get_mut(0) else {
            return ConfigStatus::Invalid;
        };
        if !FORMATS.contains(&cfg.pixel_format) {
            debug!(format = %cfg.pixel_format, "Adjusting format to NV12");
            cfg.pixel_format = PixelFormat::NV12;
            status = ConfigStatus::Adjusted;
        }

        let size = cfg
            .size
            .clamped(MIN_SIZE, MAX_SIZE)
            .aligned_down_to(SIZE_ALIGN, SIZE_ALIGN);
        if size != cfg.size {
            debug!(from = %cfg.size, to = %size, "Adjusting size");
            cfg.size = size;
            status = ConfigStatus::Adjusted;
        }

        cfg.buffer_count = OUTPUT_BUFFER_COUNT;
        cfg.update_layout();
        status
    }
}

struct IspCamera {
    id: String,
    media: Rc<MediaDevice>,
    sensor_name: String,
    sensor: V4l2Device,
    isp: V4l2Device,
    mainpath: Rc<dyn VideoNode>,
    params: Rc<dyn VideoNode>,
    stats: Rc<dyn VideoNode>,
    stream: Stream,

    ipa: IpaProxy,
    notifications: Rc<RefCell<UnboundedReceiver<IpaNotification>>>,
    ipa_source: SourceId,
    ipa_failed: bool,
    event_loop: EventLoop,

    tracker: FrameTracker,
    mapped: Vec<u64>,
    parked: VecDeque<Request>,
    /// Sensor controls waiting for the start of their frame
    delayed_controls: BTreeMap<u32, ControlList>,
    /// Controls passed to start, applied with the first request
    start_controls: ControlList,
    running: bool,
    _subscriptions: Vec<Subscription>,
}

impl Drop for IspCamera {
    fn drop(&mut self) {
        self.event_loop.remove_source(self.ipa_source);
    }
}

impl IspCamera {
    /// Create a frame for the request and ask the algorithm to fill its parameters
    ///
    /// Returns `Ok(false)` when a pool is empty and nothing was consumed.
    fn try_queue(&mut self, request: &Request) -> HalResult<bool> {
        let buffer = request.find_buffer(&self.stream).ok_or_else(|| {
            HalError::device(libc::ENOENT, format!("{} has no buffer for the main path", request.id()))
        })?;

        let frame = match self.tracker.create(request) {
            Ok(frame) => frame,
            Err(HalError::Resource(reason)) => {
                debug!(camera = %self.id, request = %request.id(), %reason, "Pool exhausted");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let mut controls = std::mem::take(&mut self.start_controls);
        controls.merge(&request.controls());

        let param_buffer = match self.tracker.find_mut(frame) {
            Some(info) => {
                info.raw_buffer = Some(buffer);
                info.param_buffer.id().as_u64()
            }
            None => return Err(HalError::Protocol(format!("frame {} vanished", frame))),
        };

        if let Err(err) = self.ipa.queue_event(IpaEvent::QueueRequest {
            frame,
            param_buffer,
            controls,
        }) {
            self.tracker.remove(frame);
            return Err(err);
        }

        trace!(camera = %self.id, frame, request = %request.id(), "Frame queued to IPA");
        Ok(true)
    }

    /// Retry parked requests in arrival order
    fn retry_parked(&mut self, completer: &mut Completer) {
        while let Some(request) = self.parked.pop_front() {
            match self.try_queue(&request) {
                Ok(true) => {}
                Ok(false) => {
                    self.parked.push_front(request);
                    break;
                }
                Err(err) => {
                    warn!(camera = %self.id, request = %request.id(), %err, "Parked request failed");
                    request.set_error(err);
                    completer.cancel_request(&request);
                }
            }
        }
    }

    /// Queue the buffers of a frame whose parameters are ready
    ///
    /// A buffer that cannot be queued will never be dequeued, so its part
    /// of the join is marked done and the request is failed.
    fn queue_frame_buffers(&mut self, frame: u32, completer: &mut Completer) {
        let Some(info) = self.tracker.find_mut(frame) else {
            debug!(camera = %self.id, frame, "Parameters for unknown frame");
            return;
        };

        if let Err(err) = self.params.queue_buffer(&info.param_buffer) {
            error!(camera = %self.id, frame, %err, "Failed to queue parameters");
            info.param_dequeued = true;
            info.request.set_error(err);
        }
        if let Err(err) = self.stats.queue_buffer(&info.stat_buffer) {
            error!(camera = %self.id, frame, %err, "Failed to queue statistics");
            info.metadata_processed = true;
            info.request.set_error(err);
        }
        if let Some(raw) = info.raw_buffer.clone() {
            if let Err(err) = self.mainpath.queue_buffer(&raw) {
                error!(camera = %self.id, frame, %err, "Failed to queue output buffer");
                raw.cancel();
                info.raw_buffer = None;
                info.request.set_error(err);
                completer.complete_buffer(&info.request, &raw);
            }
        }

        self.try_complete(frame, completer);
    }

    /// Complete the request once all three buffers of a frame are back
    fn try_complete(&mut self, frame: u32, completer: &mut Completer) {
        let raw_done = self
            .tracker
            .find(frame)
            .is_some_and(|info| info.raw_buffer.is_none());
        if !raw_done || !self.tracker.try_complete(frame) {
            return;
        }
        if let Some(info) = self.tracker.remove(frame) {
            trace!(camera = %self.id, frame, request = %info.request.id(), "Frame complete");
            completer.complete_request(&info.request);
        }
    }

    fn apply_delayed_controls(&mut self, sequence: u32) {
        let due: Vec<u32> = self.delayed_controls.range(..=sequence).map(|(f, _)| *f).collect();
        for frame in due {
            let Some(mut controls) = self.delayed_controls.remove(&frame) else {
                continue;
            };
            match self.sensor.set_controls(&mut controls) {
                Ok(SetOutcome::Applied) => {
                    trace!(camera = %self.id, frame, sequence, "Sensor controls applied");
                }
                Ok(SetOutcome::Partial { failed_at, errno }) => {
                    warn!(camera = %self.id, frame, failed_at, errno, "Sensor controls partially applied");
                }
                Err(err) => warn!(camera = %self.id, frame, %err, "Failed to apply sensor controls"),
            }
        }
    }

    fn handle_action(&mut self, action: IpaAction, completer: &mut Completer) {
        match action {
            IpaAction::ParamFilled { frame } => self.queue_frame_buffers(frame, completer),
            IpaAction::Metadata { frame, metadata } => {
                let Some(info) = self.tracker.find_mut(frame) else {
                    debug!(camera = %self.id, frame, "Metadata for unknown frame");
                    return;
                };
                info.request.metadata_mut().merge(&metadata);
                info.metadata_processed = true;
                self.try_complete(frame, completer);
            }
            IpaAction::V4l2Set { frame, controls } => {
                if !self.running {
                    return;
                }
                // The first frame has no start event to wait for
                if frame == 0 {
                    self.delayed_controls.insert(frame, controls);
                    self.apply_delayed_controls(0);
                } else {
                    self.delayed_controls
                        .entry(frame)
                        .or_default()
                        .merge(&controls);
                }
            }
        }
    }

    /// The algorithm is gone; nothing in flight can finish any more
    fn handle_ipa_failure(&mut self, reason: &str, completer: &mut Completer) {
        error!(camera = %self.id, %reason, "IPA failed, cancelling in-flight requests");
        self.ipa_failed = true;

        for frame in self.tracker.frame_ids() {
            if let Some(info) = self.tracker.remove(frame) {
                info.request
                    .set_error(HalError::Protocol(format!("IPA failed: {}", reason)));
                completer.cancel_request(&info.request);
            }
        }
        for request in self.parked.drain(..) {
            request.set_error(HalError::Protocol(format!("IPA failed: {}", reason)));
            completer.cancel_request(&request);
        }
    }

    fn handle_buffer(&mut self, node: &str, buffer: FrameBuffer, completer: &mut Completer) {
        let Some(frame) = self.tracker.find_by_buffer(buffer.id()) else {
            trace!(camera = %self.id, %node, buffer = %buffer.id(), "Buffer of no tracked frame");
            return;
        };
        let status = buffer.metadata().status;

        if node == self.mainpath.name() {
            let Some(info) = self.tracker.find_mut(frame) else {
                return;
            };
            let timestamp = buffer.metadata().timestamp;
            info.request
                .metadata_mut()
                .set(ids::SENSOR_TIMESTAMP, timestamp as i64);
            info.raw_buffer = None;
            completer.complete_buffer(&info.request, &buffer);
            self.try_complete(frame, completer);
        } else if node == self.params.name() {
            if let Some(info) = self.tracker.find_mut(frame) {
                info.param_dequeued = true;
            }
            self.try_complete(frame, completer);
        } else if node == self.stats.name() {
            if status != FrameStatus::Success {
                if let Some(info) = self.tracker.find_mut(frame) {
                    info.metadata_processed = true;
                }
                self.try_complete(frame, completer);
                return;
            }
            let event = IpaEvent::SignalStatBuffer {
                frame,
                buffer_id: buffer.id().as_u64(),
            };
            if let Err(err) = self.ipa.queue_event(event) {
                warn!(camera = %self.id, frame, %err, "Cannot hand statistics to IPA");
                if let Some(info) = self.tracker.find_mut(frame) {
                    info.metadata_processed = true;
                }
                self.try_complete(frame, completer);
            }
        }
    }

    fn release_pools(&mut self) {
        if !self.mapped.is_empty() {
            let ids = std::mem::take(&mut self.mapped);
            if let Err(err) = self.ipa.unmap_buffers(ids) {
                debug!(camera = %self.id, %err, "IPA gone, buffers not unmapped");
            }
        }
        self.tracker.clear();
    }

    fn stop_streaming(&mut self) {
        if let Err(err) = self.isp.set_frame_start_enabled(false) {
            warn!(camera = %self.id, %err, "Failed to disable frame start events");
        }
        for node in [&self.mainpath, &self.stats, &self.params] {
            node.stream_off();
        }
    }
}

/// Backend for the ISP pipeline
pub struct IspBackend {
    param_buffers: u32,
    stat_buffers: u32,
    hw_revision: u32,
    ipa_timeout: Duration,
    camera: Option<IspCamera>,
}

impl IspBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            param_buffers: config.isp.param_buffers.max(1),
            stat_buffers: config.isp.stat_buffers.max(1),
            hw_revision: config.isp.hw_revision,
            ipa_timeout: config.ipa_timeout(),
            camera: None,
        }
    }

    fn camera(&mut self, id: &str) -> HalResult<&mut IspCamera> {
        self.camera
            .as_mut()
            .filter(|c| c.id == id)
            .ok_or_else(|| HalError::NotFound(format!("camera {}", id)))
    }
}

impl PipelineBackend for IspBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn match_devices(&mut self, ctx: &MatchContext<'_>) -> HalResult<Option<MatchResult>> {
        let dm = DeviceMatch::new(isp::DRIVER)
            .entity(isp::ISP)
            .entity(isp::MAINPATH)
            .entity(isp::PARAMS)
            .entity(isp::STATS);
        let Some(media) = ctx.enumerator.search(&dm) else {
            return Ok(None);
        };

        let sensor_name = media
            .entity_by_function(EntityFunction::Sensor)
            .map(|e| e.name.clone())
            .ok_or_else(|| HalError::Configuration(format!("{}: no sensor", media.model())))?;
        let id = format!("{}:{}", media.model(), sensor_name);
        let camera_sink = ctx.sink.scoped(&id);
        let sensor = V4l2Device::open(media.subdev(&sensor_name)?, ctx.event_loop)?;
        let isp_dev = V4l2Device::open(media.subdev(isp::ISP)?, ctx.event_loop)?;

        let mainpath = media.video_node(isp::MAINPATH)?;
        let params = media.video_node(isp::PARAMS)?;
        let stats = media.video_node(isp::STATS)?;
        for node in [&mainpath, &params, &stats] {
            node.set_event_sink(camera_sink.clone());
        }

        let (ipa, notifications) =
            IpaProxy::spawn(Box::new(BasicAe::new()), ctx.event_loop.waker(), self.ipa_timeout)?;
        ipa.init(self.hw_revision)?;

        let notifications = Rc::new(RefCell::new(notifications));
        let ipa_source = {
            let notifications = notifications.clone();
            let sink = camera_sink.clone();
            ctx.event_loop.add_source(format!("{}:ipa", media.model()), move || {
                let next = notifications.borrow_mut().try_recv();
                match next {
                    Ok(notification) => {
                        sink.post(DeviceEvent::Ipa(notification));
                        SourceStatus::Dispatched
                    }
                    Err(TryRecvError::Empty) => SourceStatus::Idle,
                    Err(TryRecvError::Disconnected) => SourceStatus::Disable,
                }
            })
        };

        let tracker = FrameTracker::new();
        let mut subscriptions = Vec::new();
        {
            let sink = camera_sink.clone();
            subscriptions.push(isp_dev.frame_start().connect(move |sequence| {
                sink.post(DeviceEvent::FrameStart {
                    node: isp::ISP.to_string(),
                    sequence: *sequence,
                });
            }));
        }
        {
            let sink = camera_sink.clone();
            subscriptions.push(
                tracker
                    .buffer_available()
                    .connect(move |_| sink.post(DeviceEvent::BufferAvailable)),
            );
        }

        let mut controls = ControlInfoMap::new();
        controls.insert(ids::AE_ENABLE, ControlInfo::new(false, true, true));

        let mut properties = ControlList::new();
        properties.set(ids::MODEL, sensor_name.as_str());
        properties.set(ids::PIXEL_ARRAY_SIZE, size_property(MAX_SIZE));

        let stream = Stream::new(isp::MAINPATH);
        info!(camera = %id, ipa = %ipa.name(), "ISP camera found");

        let camera_info = CameraInfo {
            id: id.clone(),
            streams: vec![stream.clone()],
            controls,
            properties,
        };
        self.camera = Some(IspCamera {
            id,
            media: media.clone(),
            sensor_name,
            sensor,
            isp: isp_dev,
            mainpath,
            params,
            stats,
            stream,
            ipa,
            notifications,
            ipa_source,
            ipa_failed: false,
            event_loop: ctx.event_loop.clone(),
            tracker,
            mapped: Vec::new(),
            parked: VecDeque::new(),
            delayed_controls: BTreeMap::new(),
            start_controls: ControlList::new(),
            running: false,
            _subscriptions: subscriptions,
        });

        Ok(Some(MatchResult {
            media_devices: vec![media],
            cameras: vec![camera_info],
        }))
    }

    fn generate_configuration(
        &mut self,
        camera: &str,
        roles: &[StreamRole],
    ) -> HalResult<CameraConfiguration> {
        self.camera(camera)?;
        let mut config = CameraConfiguration::with_validator(Rc::new(IspValidator));
        if roles.is_empty() {
            return Ok(config);
        }

        let range = SizeRange {
            min: MIN_SIZE,
            max: MAX_SIZE,
            h_step: SIZE_ALIGN,
            v_step: SIZE_ALIGN,
        };
        config.add(
            StreamConfiguration::new(PixelFormat::NV12, DEFAULT_SIZE, OUTPUT_BUFFER_COUNT)
                .with_formats(StreamFormats::new(FORMATS.iter().map(|&f| (f, range)))),
        );
        config.validate();
        Ok(config)
    }

    fn configure(&mut self, camera: &str, config: &mut CameraConfiguration) -> HalResult<()> {
        let cam = self.camera(camera)?;
        let cfg = config
            .get_mut(0)
            .ok_or_else(|| HalError::Configuration("no stream to configure".into()))?;

        let requested = VideoFormat::new(cfg.pixel_format, cfg.size);
        let applied = cam.mainpath.set_format(&requested)?;
        if applied.pixel_format != requested.pixel_format || applied.size != requested.size {
            return Err(HalError::Configuration(format!(
                "{}: main path applied {} {} instead of {} {}",
                cam.id, applied.pixel_format, applied.size, requested.pixel_format, requested.size
            )));
        }

        let sensor_info = IpaSensorInfo {
            model: cam.sensor_name.clone(),
            output_size: cfg.size,
        };
        let mut entity_controls = EntityControls::new();
        entity_controls.insert(0, cam.sensor.control_info_map().clone());
        cam.ipa.configure(sensor_info, entity_controls)?;

        cfg.stride = applied.stride;
        cfg.frame_size = applied.frame_size;
        cfg.set_stream(cam.stream.clone());
        debug!(camera = %cam.id, config = %cfg, "ISP configured");
        Ok(())
    }

    fn export_frame_buffers(&mut self, camera: &str, stream: &Stream) -> HalResult<Vec<FrameBuffer>> {
        let cam = self.camera(camera)?;
        if *stream != cam.stream {
            return Err(HalError::NotFound(format!("{} on {}", stream.id(), cam.id)));
        }
        let count = stream
            .configuration()
            .map(|c| c.buffer_count)
            .unwrap_or(OUTPUT_BUFFER_COUNT);
        cam.mainpath.export_buffers(count)
    }

    fn start(&mut self, camera: &str, controls: Option<&ControlList>) -> HalResult<()> {
        let (param_count, stat_count) = (self.param_buffers, self.stat_buffers);
        let cam = self.camera(camera)?;

        cam.params.set_format(&VideoFormat::metadata(
            PixelFormat::ISP_PARAMS,
            isp::PARAM_BUFFER_SIZE as u32,
        ))?;
        cam.stats.set_format(&VideoFormat::metadata(
            PixelFormat::ISP_STATS,
            isp::STAT_BUFFER_SIZE as u32,
        ))?;
        let param_buffers = cam.params.export_buffers(param_count)?;
        let stat_buffers = cam.stats.export_buffers(stat_count)?;

        let shared: Vec<IpaBuffer> = param_buffers
            .iter()
            .chain(stat_buffers.iter())
            .map(IpaBuffer::from_frame_buffer)
            .collect();
        cam.mapped = shared.iter().map(|b| b.id).collect();
        cam.ipa.map_buffers(shared)?;
        cam.tracker.init(param_buffers, stat_buffers);

        cam.start_controls = controls.cloned().unwrap_or_default();
        cam.delayed_controls.clear();
        cam.running = true;

        let started = cam
            .ipa
            .start()
            .and_then(|_| cam.params.stream_on())
            .and_then(|_| cam.stats.stream_on())
            .and_then(|_| cam.mainpath.stream_on())
            .and_then(|_| cam.isp.set_frame_start_enabled(true));
        if let Err(err) = started {
            error!(camera = %cam.id, %err, "Failed to start ISP pipeline");
            cam.running = false;
            cam.stop_streaming();
            let _ = cam.ipa.stop();
            cam.release_pools();
            return Err(err);
        }

        info!(
            camera = %cam.id,
            model = %cam.media.model(),
            params = param_count,
            stats = stat_count,
            "ISP streaming"
        );
        Ok(())
    }

    fn stop(&mut self, camera: &str, _completer: &mut Completer) {
        let Ok(cam) = self.camera(camera) else {
            return;
        };

        cam.running = false;
        cam.stop_streaming();
        if let Err(err) = cam.ipa.stop() {
            warn!(camera = %cam.id, %err, "IPA stop failed");
        }
        // Answers to the old session must not reach the next one
        let mut notifications = cam.notifications.borrow_mut();
        while notifications.try_recv().is_ok() {}
        drop(notifications);

        cam.release_pools();
        cam.parked.clear();
        cam.delayed_controls.clear();
        cam.start_controls.clear();
        debug!(camera = %cam.id, "ISP stopped");
    }

    fn queue_request_device(
        &mut self,
        camera: &str,
        request: &Request,
        _completer: &mut Completer,
    ) -> HalResult<()> {
        let cam = self.camera(camera)?;
        if cam.ipa_failed {
            return Err(HalError::Protocol(format!("{}: IPA is not running", cam.id)));
        }
        if request.find_buffer(&cam.stream).is_none() {
            return Err(HalError::device(
                libc::ENOENT,
                format!("{} has no buffer for the main path", request.id()),
            ));
        }

        if !cam.parked.is_empty() {
            cam.parked.push_back(request.clone());
            debug!(camera = %cam.id, request = %request.id(), parked = cam.parked.len(), "Request parked");
            return Ok(());
        }
        if !cam.try_queue(request)? {
            cam.parked.push_back(request.clone());
            debug!(camera = %cam.id, request = %request.id(), "Request parked");
        }
        Ok(())
    }

    fn handle_event(&mut self, event: DeviceEvent, completer: &mut Completer) {
        let Some(cam) = self.camera.as_mut() else {
            return;
        };
        if !cam.running {
            trace!(camera = %cam.id, ?event, "Event while stopped");
            return;
        }

        match event {
            DeviceEvent::BufferReady { node, buffer } => cam.handle_buffer(&node, buffer, completer),
            DeviceEvent::FrameStart { sequence, .. } => cam.apply_delayed_controls(sequence),
            DeviceEvent::BufferAvailable => cam.retry_parked(completer),
            DeviceEvent::Ipa(IpaNotification::Action(action)) => cam.handle_action(action, completer),
            DeviceEvent::Ipa(IpaNotification::Fatal(reason)) => {
                cam.handle_ipa_failure(&reason, completer)
            }
        }
    }
}
