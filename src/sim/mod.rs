// SPDX-License-Identifier: GPL-3.0-only

//! Simulated imaging hardware
//!
//! Stand-ins for kernel video nodes and subdevices so the whole capture
//! lifecycle runs without real devices. Two presets build complete media
//! graphs:
//!
//! ```text
//!   vimc:    Sensor B ─► Debayer B ─► Scaler ─► RGB/YUV Capture
//!                                  └──────────► Raw Capture 1
//!
//!   rkisp1:  sensor ─► rkisp1_isp ─► rkisp1_mainpath
//!                         ▲    └───► rkisp1_stats
//!                   rkisp1_params
//! ```

pub mod subdev;
pub mod video;

use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub use subdev::{SimControl, SimSubdevice};
pub use video::{CompletionMode, SimVideoNode};

use crate::constants::{isp, virtual_pipeline};
use crate::core::device::{EntityFunction, EntityNode, MediaDevice};
use crate::core::stream::PixelFormat;
use crate::event_loop::EventLoop;
use crate::v4l2::ioctl::*;

/// Private control carrying a test pattern lookup table
pub const SIM_CID_TEST_PATTERN_LUT: u32 = V4L2_CID_USER_BASE + 0x1000;

/// Kind of simulated device listed in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimKind {
    Vimc,
    Rkisp1,
}

/// A simulated device described in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub kind: SimKind,
    pub model: String,
    /// Complete queued buffers on their own; off leaves them for manual completion
    #[serde(default = "default_auto_complete")]
    pub auto_complete: bool,
}

fn default_auto_complete() -> bool {
    true
}

impl SimDeviceConfig {
    pub fn new(kind: SimKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            auto_complete: true,
        }
    }
}

/// Handles to a simulated vimc graph
pub struct SimVimc {
    pub media: MediaDevice,
    pub sensor: Rc<SimSubdevice>,
    pub capture: Rc<SimVideoNode>,
    pub raw: Rc<SimVideoNode>,
}

/// Handles to a simulated rkisp1 graph
pub struct SimRkisp1 {
    pub media: MediaDevice,
    pub sensor: Rc<SimSubdevice>,
    pub isp: Rc<SimSubdevice>,
    pub mainpath: Rc<SimVideoNode>,
    pub params: Rc<SimVideoNode>,
    pub stats: Rc<SimVideoNode>,
}

/// Build the virtual test pipeline graph
pub fn vimc_device(event_loop: &EventLoop, model: &str) -> SimVimc {
    let sensor = Rc::new(
        SimSubdevice::new(virtual_pipeline::SENSOR)
            .with_control(SimControl::class(V4L2_CID_USER_CLASS, "User Controls"))
            .with_control(SimControl::integer(V4L2_CID_BRIGHTNESS, "Brightness", 0, 255, 128))
            .with_control(SimControl::integer(V4L2_CID_CONTRAST, "Contrast", 0, 255, 128))
            .with_control(SimControl::integer(V4L2_CID_SATURATION, "Saturation", 0, 255, 128))
            .with_control(SimControl::integer(V4L2_CID_HUE, "Hue", -128, 127, 0))
            .with_control(SimControl::byte_array(SIM_CID_TEST_PATTERN_LUT, "Test Pattern LUT", 8)),
    );
    let capture = SimVideoNode::new(
        virtual_pipeline::CAPTURE,
        event_loop,
        vec![PixelFormat::BGR888, PixelFormat::RGB888],
    );
    let raw = SimVideoNode::new(virtual_pipeline::RAW_CAPTURE, event_loop, Vec::new());
    capture.set_frame_sync(sensor.clone());

    let mut media = MediaDevice::new(virtual_pipeline::DRIVER, model);
    media.add_entity(
        virtual_pipeline::SENSOR,
        EntityFunction::Sensor,
        EntityNode::Subdev(sensor.clone()),
    );
    media.add_entity(virtual_pipeline::DEBAYER, EntityFunction::Isp, EntityNode::None);
    media.add_entity(virtual_pipeline::SCALER, EntityFunction::Scaler, EntityNode::None);
    media.add_entity(
        virtual_pipeline::CAPTURE,
        EntityFunction::VideoCapture,
        EntityNode::Video(capture.clone()),
    );
    media.add_entity(
        virtual_pipeline::RAW_CAPTURE,
        EntityFunction::VideoCapture,
        EntityNode::Video(raw.clone()),
    );

    SimVimc {
        media,
        sensor,
        capture,
        raw,
    }
}

/// Scene brightness reported by configured ISP devices, below the AE target
const DEFAULT_SCENE_MEAN: u8 = 40;

/// Write an exposure statistics block with every zone at `mean`
pub fn fill_ae_stats(bytes: &mut [u8], mean: u8) {
    if bytes.len() < isp::STAT_AE_MEAN_OFFSET + isp::AE_MEAN_ZONES {
        return;
    }
    bytes.fill(0);
    bytes[isp::STAT_MEAS_TYPE_OFFSET..isp::STAT_MEAS_TYPE_OFFSET + 4]
        .copy_from_slice(&isp::STAT_AUTOEXP.to_le_bytes());
    bytes[isp::STAT_AE_MEAN_OFFSET..isp::STAT_AE_MEAN_OFFSET + isp::AE_MEAN_ZONES].fill(mean);
}

/// Build the ISP pipeline graph; statistics report a constant `mean`
pub fn rkisp1_device(event_loop: &EventLoop, model: &str, mean: u8) -> SimRkisp1 {
    let sensor_name = format!("{} sensor", model);
    let sensor = Rc::new(
        SimSubdevice::new(sensor_name.clone())
            .with_control(SimControl::integer(V4L2_CID_EXPOSURE, "Exposure", 1, 1000, 100))
            .with_control(SimControl::integer(V4L2_CID_ANALOGUE_GAIN, "Analogue Gain", 16, 256, 16)),
    );
    let isp_subdev = Rc::new(SimSubdevice::new(isp::ISP));
    let mainpath = SimVideoNode::new(
        isp::MAINPATH,
        event_loop,
        vec![PixelFormat::NV12, PixelFormat::YUYV],
    );
    let params = SimVideoNode::new(isp::PARAMS, event_loop, vec![PixelFormat::ISP_PARAMS]);
    let stats = SimVideoNode::new(isp::STATS, event_loop, vec![PixelFormat::ISP_STATS]);

    mainpath.set_frame_sync(isp_subdev.clone());
    stats.set_filler(move |buffer, _| {
        if let Some(plane) = buffer.planes().first() {
            if let Ok(mut bytes) = plane.memory.write() {
                fill_ae_stats(&mut bytes, mean);
            }
        }
    });

    let mut media = MediaDevice::new(isp::DRIVER, model);
    media.add_entity(
        sensor_name,
        EntityFunction::Sensor,
        EntityNode::Subdev(sensor.clone()),
    );
    media.add_entity(isp::ISP, EntityFunction::Isp, EntityNode::Subdev(isp_subdev.clone()));
    media.add_entity(
        isp::MAINPATH,
        EntityFunction::VideoCapture,
        EntityNode::Video(mainpath.clone()),
    );
    media.add_entity(
        isp::PARAMS,
        EntityFunction::VideoOutput,
        EntityNode::Video(params.clone()),
    );
    media.add_entity(
        isp::STATS,
        EntityFunction::VideoCapture,
        EntityNode::Video(stats.clone()),
    );

    SimRkisp1 {
        media,
        sensor,
        isp: isp_subdev,
        mainpath,
        params,
        stats,
    }
}

/// Build the media device for a configured simulated device
pub fn build(event_loop: &EventLoop, config: &SimDeviceConfig) -> MediaDevice {
    let mode = if config.auto_complete {
        CompletionMode::Auto
    } else {
        CompletionMode::Manual
    };
    match config.kind {
        SimKind::Vimc => {
            let sim = vimc_device(event_loop, &config.model);
            sim.capture.set_mode(mode);
            sim.raw.set_mode(mode);
            sim.media
        }
        SimKind::Rkisp1 => {
            let sim = rkisp1_device(event_loop, &config.model, DEFAULT_SCENE_MEAN);
            for node in [&sim.mainpath, &sim.params, &sim.stats] {
                node.set_mode(mode);
            }
            sim.media
        }
    }
}
