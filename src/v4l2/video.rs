// SPDX-License-Identifier: GPL-3.0-only

//! Buffer queue interface of a video node

use crate::core::framebuffer::FrameBuffer;
use crate::core::stream::{PixelFormat, Size};
use crate::errors::HalResult;
use crate::pipeline::EventSink;

/// Format negotiated on a video node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub stride: u32,
    pub frame_size: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, size: Size) -> Self {
        let (stride, frame_size) = pixel_format.frame_layout(size);
        Self {
            pixel_format,
            size,
            stride,
            frame_size,
        }
    }

    /// Metadata formats carry a fixed-size blob
    pub fn metadata(pixel_format: PixelFormat, frame_size: u32) -> Self {
        Self {
            pixel_format,
            size: Size::default(),
            stride: 0,
            frame_size,
        }
    }
}

/// A capture or output DMA queue
///
/// Completed buffers are reported asynchronously as
/// [`DeviceEvent::BufferReady`](crate::pipeline::DeviceEvent) through the
/// sink installed with [`VideoNode::set_event_sink`].
pub trait VideoNode {
    fn name(&self) -> &str;

    /// Apply a format, returning what the node accepted
    fn set_format(&self, format: &VideoFormat) -> HalResult<VideoFormat>;

    fn format(&self) -> Option<VideoFormat>;

    /// Allocate buffers sized for the current format
    fn export_buffers(&self, count: u32) -> HalResult<Vec<FrameBuffer>>;

    fn queue_buffer(&self, buffer: &FrameBuffer) -> HalResult<()>;

    fn stream_on(&self) -> HalResult<()>;

    /// Stop the queue; returns the buffers that were still queued, cancelled
    fn stream_off(&self) -> Vec<FrameBuffer>;

    fn set_event_sink(&self, sink: EventSink);

    fn queued_count(&self) -> usize;
}
