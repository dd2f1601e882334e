// SPDX-License-Identifier: GPL-3.0-only

//! Virtual test pipeline
//!
//! Drives the vimc media graph: a sensor subdevice whose controls set the
//! test pattern, and one RGB capture node producing frames scaled 3x from
//! the sensor. Every request carries exactly one buffer and completes as
//! soon as that buffer is dequeued.

use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use super::size_property;
use crate::constants::virtual_pipeline::{self as vimc, BUFFER_COUNT, DEFAULT_SIZE, MAX_SIZE, MIN_SIZE, SIZE_ALIGN};
use crate::core::controls::{ControlInfo, ControlInfoMap, ControlList, ControlValue, ids};
use crate::core::device::{DeviceMatch, MediaDevice};
use crate::core::framebuffer::FrameBuffer;
use crate::core::request::Request;
use crate::core::stream::{
    CameraConfiguration, ConfigStatus, ConfigValidator, PixelFormat, Size, SizeRange, Stream,
    StreamConfiguration, StreamFormats, StreamRole, Transform,
};
use crate::errors::{HalError, HalResult};
use crate::pipeline::{CameraInfo, Completer, DeviceEvent, MatchContext, MatchResult, PipelineBackend};
use crate::v4l2::ioctl::{V4L2_CID_BRIGHTNESS, V4L2_CID_CONTRAST, V4L2_CID_SATURATION};
use crate::v4l2::{SetOutcome, V4l2Device, VideoFormat, VideoNode};

pub const NAME: &str = "vimc";

const FORMATS: [PixelFormat; 2] = [PixelFormat::BGR888, PixelFormat::RGB888];

/// Adjusts configurations to what the capture node can produce
#[derive(Debug, Default)]
pub struct VirtualValidator;

impl ConfigValidator for VirtualValidator {
    fn validate(&self, config: &mut CameraConfiguration) -> ConfigStatus {
        if config.is_empty() {
            return ConfigStatus::Invalid;
        }

        let mut status = ConfigStatus::Valid;

        if config.transform != Transform::Identity {
            config.transform = Transform::Identity;
            status = ConfigStatus::Adjusted;
        }

        // Only one stream is produced
        if config.len() > 1 {
            config.entries_mut().truncate(1);
            status = ConfigStatus::Adjusted;
        }

        let Some(cfg) = config.get_mut(0) else {
            return ConfigStatus::Invalid;
        };

        if !FORMATS.contains(&cfg.pixel_format) {
            debug!(format = %cfg.pixel_format, "Adjusting format to BGR888");
            cfg.pixel_format = PixelFormat::BGR888;
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

        cfg.buffer_count = BUFFER_COUNT;
        cfg.update_layout();

        status
    }
}

fn stream_formats() -> StreamFormats {
    let range = SizeRange {
        min: MIN_SIZE,
        max: MAX_SIZE,
        h_step: SIZE_ALIGN,
        v_step: SIZE_ALIGN,
    };
    StreamFormats::new(FORMATS.iter().map(|&f| (f, range)))
}

/// Map a camera control onto the sensor's 0..255 test pattern controls
fn sensor_control(id: u32, value: &ControlValue) -> Option<(u32, i32)> {
    let value = value.as_f32()?;
    let (cid, raw) = match id {
        ids::BRIGHTNESS => (V4L2_CID_BRIGHTNESS, value * 128.0 + 128.0),
        ids::CONTRAST => (V4L2_CID_CONTRAST, value * 128.0),
        ids::SATURATION => (V4L2_CID_SATURATION, value * 128.0),
        _ => return None,
    };
    Some((cid, (raw.round() as i32).clamp(0, 255)))
}

struct VirtualCamera {
    id: String,
    media: Rc<MediaDevice>,
    sensor: V4l2Device,
    capture: Rc<dyn VideoNode>,
    stream: Stream,
}

impl VirtualCamera {
    /// Push request controls to the sensor before the frame is queued
    fn process_controls(&self, controls: &ControlList) -> HalResult<()> {
        let mut sensor_controls = ControlList::new();
        for (id, value) in controls.iter() {
            match sensor_control(id, value) {
                Some((cid, raw)) if self.sensor.control_info(cid).is_some() => {
                    sensor_controls.set(cid, raw);
                }
                Some(_) => trace!(camera = %self.id, control = ids::name(id), "Sensor lacks control"),
                None => {}
            }
        }

        match self.sensor.set_controls(&mut sensor_controls)? {
            SetOutcome::Applied => Ok(()),
            SetOutcome::Partial { failed_at, errno } => Err(HalError::device(
                errno,
                format!("{}: sensor control {} rejected", self.id, failed_at),
            )),
        }
    }
}

/// Backend for the virtual test pipeline
#[derive(Default)]
pub struct VirtualBackend {
    camera: Option<VirtualCamera>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn camera(&self, id: &str) -> HalResult<&VirtualCamera> {
        self.camera
            .as_ref()
            .filter(|c| c.id == id)
            .ok_or_else(|| HalError::NotFound(format!("camera {}", id)))
    }
}

impl PipelineBackend for VirtualBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn match_devices(&mut self, ctx: &MatchContext<'_>) -> HalResult<Option<MatchResult>> {
        let dm = DeviceMatch::new(vimc::DRIVER)
            .entity(vimc::SENSOR)
            .entity(vimc::DEBAYER)
            .entity(vimc::SCALER)
            .entity(vimc::CAPTURE)
            .entity(vimc::RAW_CAPTURE);
        let Some(media) = ctx.enumerator.search(&dm) else {
            return Ok(None);
        };

        let sensor = V4l2Device::open(media.subdev(vimc::SENSOR)?, ctx.event_loop)?;
        let id = format!("{}:{}", media.model(), vimc::SENSOR);
        let capture = media.video_node(vimc::CAPTURE)?;
        capture.set_event_sink(ctx.sink.scoped(&id));

        let mut controls = ControlInfoMap::new();
        let sensor_map = sensor.control_info_map();
        if sensor_map.contains(V4L2_CID_BRIGHTNESS) {
            controls.insert(ids::BRIGHTNESS, ControlInfo::new(-1.0f32, 1.0f32, 0.0f32));
        }
        if sensor_map.contains(V4L2_CID_CONTRAST) {
            controls.insert(ids::CONTRAST, ControlInfo::new(0.0f32, 2.0f32, 1.0f32));
        }
        if sensor_map.contains(V4L2_CID_SATURATION) {
            controls.insert(ids::SATURATION, ControlInfo::new(0.0f32, 2.0f32, 1.0f32));
        }

        let mut properties = ControlList::new();
        properties.set(ids::MODEL, vimc::SENSOR);
        properties.set(ids::PIXEL_ARRAY_SIZE, size_property(MAX_SIZE));

        let stream = Stream::new(vimc::CAPTURE);
        info!(camera = %id, controls = controls.len(), "Virtual camera found");

        let camera_info = CameraInfo {
            id: id.clone(),
            streams: vec![stream.clone()],
            controls,
            properties,
        };
        self.camera = Some(VirtualCamera {
            id,
            media: media.clone(),
            sensor,
            capture,
            stream,
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
        let mut config = CameraConfiguration::with_validator(Rc::new(VirtualValidator));
        if roles.is_empty() {
            return Ok(config);
        }

        config.add(
            StreamConfiguration::new(PixelFormat::BGR888, DEFAULT_SIZE, BUFFER_COUNT)
                .with_formats(stream_formats()),
        );
        config.validate();
        Ok(config)
    }

    fn configure(&mut self, camera: &str, config: &mut CameraConfiguration) -> HalResult<()> {
        let cam = self.camera(camera)?;
        let cfg = config
            .get_mut(0)
            .ok_or_else(|| HalError::Configuration("no stream to configure".into()))?;

        // The scaler triples the sensor output
        let sensor_size = Size::new(cfg.size.width / 3, cfg.size.height / 3);
        debug!(camera = %cam.id, sensor = %sensor_size, "Sensor format");

        let requested = VideoFormat::new(cfg.pixel_format, cfg.size);
        let applied = cam.capture.set_format(&requested)?;
        if applied.pixel_format != requested.pixel_format || applied.size != requested.size {
            return Err(HalError::Configuration(format!(
                "{}: capture node applied {} {} instead of {} {}",
                cam.id, applied.pixel_format, applied.size, requested.pixel_format, requested.size
            )));
        }

        cfg.stride = applied.stride;
        cfg.frame_size = applied.frame_size;
        cfg.set_stream(cam.stream.clone());
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
            .unwrap_or(BUFFER_COUNT);
        cam.capture.export_buffers(count)
    }

    fn start(&mut self, camera: &str, controls: Option<&ControlList>) -> HalResult<()> {
        let cam = self.camera(camera)?;
        if let Some(controls) = controls {
            cam.process_controls(controls)?;
        }
        cam.capture.stream_on()?;
        debug!(camera = %cam.id, model = %cam.media.model(), "Capture started");
        Ok(())
    }

    fn stop(&mut self, camera: &str, _completer: &mut Completer) {
        let Ok(cam) = self.camera(camera) else {
            return;
        };
        let returned = cam.capture.stream_off();
        debug!(camera = %cam.id, returned = returned.len(), "Capture stopped");
    }

    fn queue_request_device(
        &mut self,
        camera: &str,
        request: &Request,
        _completer: &mut Completer,
    ) -> HalResult<()> {
        let cam = self.camera(camera)?;
        let buffer = request.find_buffer(&cam.stream).ok_or_else(|| {
            HalError::device(libc::ENOENT, format!("{} has no buffer for the capture stream", request.id()))
        })?;

        cam.process_controls(&request.controls())?;
        cam.capture.queue_buffer(&buffer)
    }

    fn handle_event(&mut self, event: DeviceEvent, completer: &mut Completer) {
        let DeviceEvent::BufferReady { node, buffer } = event else {
            trace!(?event, "Ignoring event");
            return;
        };
        let Some(cam) = self.camera.as_ref() else {
            return;
        };
        if node != cam.capture.name() {
            trace!(%node, "Ignoring buffer from unused node");
            return;
        }
        let Some(request) = buffer.request() else {
            warn!(camera = %cam.id, buffer = %buffer.id(), "Completed buffer has no request");
            return;
        };

        let timestamp = buffer.metadata().timestamp;
        request
            .metadata_mut()
            .set(ids::SENSOR_TIMESTAMP, ControlValue::Int64(timestamp as i64));

        completer.complete_buffer(&request, &buffer);
        completer.complete_request(&request);
    }
}
