// SPDX-License-Identifier: GPL-3.0-only

//! Kernel video device interface
//!
//! - [`ioctl`]: raw extended control and event ioctls, [`ControlIo`] seam
//! - [`device`]: typed control lists and the frame-start event bridge
//! - [`video`]: buffer queue interface of video nodes

pub mod device;
pub mod ioctl;
pub mod video;

pub use device::{SetOutcome, V4l2ControlInfo, V4l2Device, list_controls};
pub use ioctl::{ControlIo, ExtControlError, QueryExtCtrl, RawControl, RawEvent, RawPayload, V4l2Node};
pub use video::{VideoFormat, VideoNode};
