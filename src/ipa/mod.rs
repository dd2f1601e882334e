// SPDX-License-Identifier: GPL-3.0-only

//! Image processing algorithm boundary
//!
//! Algorithms run on their own worker thread behind an [`IpaProxy`]. The
//! pipeline talks to them with [`IpaEvent`]s and receives [`IpaAction`]s
//! back as [`IpaNotification`]s on the event loop.
//!
//! ```text
//!   ISP backend ── IpaEvent ──► IpaProxy ══ channel ══► worker: IpaInterface
//!        ▲                                                   │
//!        └── DeviceEvent::Ipa ◄── loop source ◄══ channel ═══┘
//! ```

pub mod ae;
pub mod proxy;

use std::collections::BTreeMap;
use std::fmt;

use crate::core::controls::{ControlInfoMap, ControlList};
use crate::core::framebuffer::{FrameBuffer, PlaneMemory};
use crate::core::stream::Size;
use crate::errors::HalResult;

pub use ae::BasicAe;
pub use proxy::IpaProxy;

/// A pipeline buffer shared with the algorithm
#[derive(Clone)]
pub struct IpaBuffer {
    pub id: u64,
    pub planes: Vec<PlaneMemory>,
}

impl IpaBuffer {
    pub fn from_frame_buffer(buffer: &FrameBuffer) -> Self {
        Self {
            id: buffer.id().as_u64(),
            planes: buffer.planes().iter().map(|p| p.memory.clone()).collect(),
        }
    }
}

impl fmt::Debug for IpaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpaBuffer")
            .field("id", &self.id)
            .field("planes", &self.planes.len())
            .finish()
    }
}

/// Sensor description passed at configure time
#[derive(Debug, Clone, Default)]
pub struct IpaSensorInfo {
    pub model: String,
    pub output_size: Size,
}

/// Control limits per entity, keyed by V4L2 control id
pub type EntityControls = BTreeMap<u32, ControlInfoMap>;

/// Work items sent to the algorithm
#[derive(Debug, Clone)]
pub enum IpaEvent {
    /// Fill the parameter buffer for a frame from the request controls
    QueueRequest {
        frame: u32,
        param_buffer: u64,
        controls: ControlList,
    },
    /// Statistics for a frame are ready in the given buffer
    SignalStatBuffer { frame: u32, buffer_id: u64 },
}

/// Results produced by the algorithm
#[derive(Debug, Clone)]
pub enum IpaAction {
    /// Apply sensor controls, keyed by V4L2 id, at the start of `frame`
    V4l2Set { frame: u32, controls: ControlList },
    /// The parameter buffer for `frame` is ready to queue
    ParamFilled { frame: u32 },
    /// Metadata computed from the statistics of `frame`
    Metadata { frame: u32, metadata: ControlList },
}

/// Messages from the worker thread
#[derive(Debug, Clone)]
pub enum IpaNotification {
    Action(IpaAction),
    /// The algorithm failed; the worker has stopped
    Fatal(String),
}

/// An image processing algorithm module
pub trait IpaInterface: Send {
    fn name(&self) -> &str;

    /// Check that the algorithm supports the hardware
    fn init(&mut self, hw_revision: u32) -> HalResult<()>;

    fn configure(
        &mut self,
        sensor: &IpaSensorInfo,
        entity_controls: &EntityControls,
    ) -> HalResult<()>;

    fn start(&mut self, actions: &mut Vec<IpaAction>) -> HalResult<()>;

    fn stop(&mut self);

    fn map_buffers(&mut self, buffers: Vec<IpaBuffer>);

    fn unmap_buffers(&mut self, ids: &[u64]);

    /// Handle one event; an error is fatal to the worker
    fn process_event(&mut self, event: IpaEvent, actions: &mut Vec<IpaAction>) -> HalResult<()>;
}
