// SPDX-License-Identifier: GPL-3.0-only

//! Application-facing camera model
//!
//! - [`camera`]: camera handle and lifecycle state machine
//! - [`request`]: capture requests
//! - [`framebuffer`]: frame buffers and plane memory
//! - [`stream`]: streams and configurations
//! - [`controls`]: typed controls
//! - [`manager`]: camera enumeration and hotplug
//! - [`device`]: media devices and matching
//! - [`allocator`]: buffer allocation

pub mod allocator;
pub mod camera;
pub mod controls;
pub mod device;
pub mod framebuffer;
pub mod manager;
pub mod request;
pub mod stream;

pub use allocator::FrameBufferAllocator;
pub use camera::{Camera, CameraState};
pub use controls::{ControlId, ControlInfo, ControlInfoMap, ControlList, ControlType, ControlValue};
pub use device::{DeviceEnumerator, DeviceMatch, EntityFunction, EntityNode, MediaDevice};
pub use framebuffer::{BufferId, FrameBuffer, FrameMetadata, FrameStatus, Plane, PlaneMemory};
pub use manager::CameraManager;
pub use request::{Request, RequestId, RequestStatus, ReuseFlag};
pub use stream::{
    CameraConfiguration, ConfigStatus, ConfigValidator, PixelFormat, Size, SizeRange, Stream,
    StreamConfiguration, StreamFormats, StreamId, StreamRole, Transform,
};
