// SPDX-License-Identifier: GPL-3.0-only

//! Camera HAL - request-based camera capture over media pipelines
//!
//! Applications find cameras through the [`CameraManager`], take exclusive
//! ownership, configure streams and then queue [`Request`]s that come back
//! through the `request_completed` signal in submission order. Hardware
//! families plug in as pipeline backends; an image signal processor can
//! delegate its control loop to an isolated algorithm worker.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`core`]: cameras, requests, buffers, streams and controls
//! - [`pipeline`]: the generic pipeline handler and frame join tracking
//! - [`backends`]: the virtual and ISP pipeline backends
//! - [`ipa`]: image processing algorithms behind a message boundary
//! - [`v4l2`]: kernel controls and events
//! - [`sim`]: simulated media devices
//! - [`config`]: user configuration handling
//!
//! # Example
//!
//! ```ignore
//! let manager = CameraManager::new(Config::load()?);
//! manager.start()?;
//! let camera = manager.cameras().into_iter().next().ok_or("no camera")?;
//! camera.acquire()?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod core;
pub mod errors;
pub mod event_loop;
pub mod ipa;
pub mod pipeline;
pub mod signal;
pub mod sim;
pub mod v4l2;

// Re-export commonly used types
pub use config::Config;
pub use core::{
    Camera, CameraConfiguration, CameraManager, CameraState, ControlList, ControlValue,
    FrameBuffer, FrameBufferAllocator, PixelFormat, Request, RequestStatus, ReuseFlag, Size,
    Stream, StreamConfiguration, StreamRole,
};
pub use errors::{HalError, HalResult};
pub use event_loop::EventLoop;
pub use signal::{Signal, Subscription};
