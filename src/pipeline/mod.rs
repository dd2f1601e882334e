// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline orchestration
//!
//! - [`handler`]: the generic [`PipelineHandler`] and the [`PipelineBackend`] seam
//! - [`frames`]: join tracker for multi-buffer frames
//! - [`event`]: device events and deferred completions

pub mod event;
pub mod frames;
pub mod handler;

pub use event::{Completer, Completion, DeviceEvent, EventSink};
pub use frames::{FrameInfo, FrameTracker};
pub use handler::{CameraInfo, MatchContext, MatchResult, PipelineBackend, PipelineHandler};
