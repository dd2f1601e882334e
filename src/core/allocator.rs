// SPDX-License-Identifier: GPL-3.0-only

//! Buffer allocation for configured streams

use std::collections::BTreeMap;

use tracing::debug;

use super::camera::{Camera, CameraState};
use super::framebuffer::FrameBuffer;
use super::stream::{Stream, StreamId};
use crate::errors::{HalError, HalResult};

/// Allocates backend-exported buffers for the streams of one camera
pub struct FrameBufferAllocator {
    camera: Camera,
    buffers: BTreeMap<StreamId, Vec<FrameBuffer>>,
}

impl FrameBufferAllocator {
    pub fn new(camera: &Camera) -> Self {
        Self {
            camera: camera.clone(),
            buffers: BTreeMap::new(),
        }
    }

    /// Allocate the configured number of buffers for `stream`
    ///
    /// Only allowed while the camera is configured and not running.
    pub fn allocate(&mut self, stream: &Stream) -> HalResult<usize> {
        if self.camera.state() != CameraState::Configured {
            return Err(HalError::State(format!(
                "{}: buffers can only be allocated while configured",
                self.camera.id()
            )));
        }
        if !self.camera.is_stream_active(stream) {
            return Err(HalError::InvalidRequest(format!(
                "{} is not part of the active configuration",
                stream.id()
            )));
        }
        if self.buffers.contains_key(&stream.id()) {
            return Err(HalError::Resource(format!(
                "buffers already allocated for {}",
                stream.id()
            )));
        }

        let buffers = self
            .camera
            .pipe()
            .export_frame_buffers(self.camera.id(), stream)?;
        let count = buffers.len();
        debug!(camera = %self.camera.id(), stream = %stream.id(), count, "Allocated frame buffers");
        self.buffers.insert(stream.id(), buffers);
        Ok(count)
    }

    pub fn free(&mut self, stream: &Stream) -> HalResult<()> {
        if self.camera.state() == CameraState::Running {
            return Err(HalError::State(format!(
                "{}: cannot free buffers while running",
                self.camera.id()
            )));
        }
        self.buffers
            .remove(&stream.id())
            .map(|_| ())
            .ok_or_else(|| HalError::NotFound(format!("no buffers for {}", stream.id())))
    }

    pub fn buffers(&self, stream: &Stream) -> &[FrameBuffer] {
        self.buffers
            .get(&stream.id())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn allocated(&self) -> bool {
        !self.buffers.is_empty()
    }
}
