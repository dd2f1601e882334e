// SPDX-License-Identifier: GPL-3.0-only

//! In-memory video node
//!
//! Buffers queued to the node complete in FIFO order, either automatically
//! (one per event loop iteration while streaming) or on explicit request so
//! tests can complete them out of order or with errors.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, trace};

use super::subdev::SimSubdevice;
use crate::core::framebuffer::{FrameBuffer, FrameMetadata, FrameStatus, Plane};
use crate::core::stream::PixelFormat;
use crate::errors::{HalError, HalResult};
use crate::event_loop::{EventLoop, SourceId, SourceStatus};
use crate::pipeline::{DeviceEvent, EventSink};
use crate::v4l2::video::{VideoFormat, VideoNode};

/// How queued buffers get completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// One buffer per event loop iteration while streaming
    Auto,
    /// Only through [`SimVideoNode::complete_next`] and friends
    Manual,
}

type Filler = Box<dyn Fn(&FrameBuffer, u32)>;

/// Simulated capture or output DMA queue
pub struct SimVideoNode {
    name: String,
    self_ref: Weak<SimVideoNode>,
    event_loop: EventLoop,
    formats: Vec<PixelFormat>,
    format: Cell<Option<VideoFormat>>,
    queue: RefCell<VecDeque<FrameBuffer>>,
    streaming: Cell<bool>,
    sink: RefCell<Option<EventSink>>,
    mode: Cell<CompletionMode>,
    sequence: Cell<u32>,
    epoch: Instant,
    queue_failure: Cell<Option<i32>>,
    frame_sync: RefCell<Option<Rc<SimSubdevice>>>,
    filler: RefCell<Option<Filler>>,
    source: Cell<Option<SourceId>>,
}

impl SimVideoNode {
    /// Create a node accepting the given formats; empty accepts anything
    pub fn new(name: impl Into<String>, event_loop: &EventLoop, formats: Vec<PixelFormat>) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            name: name.into(),
            self_ref: self_ref.clone(),
            event_loop: event_loop.clone(),
            formats,
            format: Cell::new(None),
            queue: RefCell::new(VecDeque::new()),
            streaming: Cell::new(false),
            sink: RefCell::new(None),
            mode: Cell::new(CompletionMode::Auto),
            sequence: Cell::new(0),
            epoch: Instant::now(),
            queue_failure: Cell::new(None),
            frame_sync: RefCell::new(None),
            filler: RefCell::new(None),
            source: Cell::new(None),
        })
    }

    pub fn set_mode(&self, mode: CompletionMode) {
        self.mode.set(mode);
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode.get()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.get()
    }

    /// Make the next `queue_buffer` fail with a positive errno
    pub fn fail_next_queue(&self, errno: i32) {
        self.queue_failure.set(Some(errno));
    }

    /// Raise a start-of-frame event on `subdev` before each completion
    pub fn set_frame_sync(&self, subdev: Rc<SimSubdevice>) {
        *self.frame_sync.borrow_mut() = Some(subdev);
    }

    /// Write frame content before completion; gets the frame sequence
    pub fn set_filler(&self, filler: impl Fn(&FrameBuffer, u32) + 'static) {
        *self.filler.borrow_mut() = Some(Box::new(filler));
    }

    /// Complete the oldest queued buffer
    pub fn complete_next(&self, status: FrameStatus) -> bool {
        self.complete_at(0, status)
    }

    /// Complete the buffer at `index` in queue order
    pub fn complete_at(&self, index: usize, status: FrameStatus) -> bool {
        let Some(buffer) = self.queue.borrow_mut().remove(index) else {
            return false;
        };

        let sequence = self.sequence.get();
        self.sequence.set(sequence.wrapping_add(1));

        if status == FrameStatus::Success {
            if let Some(subdev) = self.frame_sync.borrow().as_ref() {
                subdev.frame_sync(sequence);
            }
            if let Some(filler) = self.filler.borrow().as_ref() {
                filler(&buffer, sequence);
            }
        }

        let bytes_used = match self.format.get() {
            Some(format) if status == FrameStatus::Success => buffer
                .planes()
                .iter()
                .map(|p| (p.length as u32).min(format.frame_size.max(1)))
                .collect(),
            _ => vec![0; buffer.planes().len()],
        };
        buffer.set_metadata(FrameMetadata {
            status,
            sequence,
            timestamp: self.epoch.elapsed().as_nanos() as u64 + 1,
            bytes_used,
        });

        trace!(node = %self.name, buffer = %buffer.id(), sequence, ?status, "Buffer done");
        match self.sink.borrow().as_ref() {
            Some(sink) => sink.post(DeviceEvent::BufferReady {
                node: self.name.clone(),
                buffer,
            }),
            None => debug!(node = %self.name, "No event sink, dropping completion"),
        }
        true
    }

    fn poll(&self) -> SourceStatus {
        if self.mode.get() != CompletionMode::Auto || self.queue.borrow().is_empty() {
            return SourceStatus::Idle;
        }
        self.complete_next(FrameStatus::Success);
        SourceStatus::Dispatched
    }
}

impl VideoNode for SimVideoNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_format(&self, format: &VideoFormat) -> HalResult<VideoFormat> {
        let mut applied = *format;
        if !self.formats.is_empty() && !self.formats.contains(&format.pixel_format) {
            applied = match self.formats.first() {
                Some(&first) if format.size.is_null() => VideoFormat::metadata(first, format.frame_size),
                Some(&first) => VideoFormat::new(first, format.size),
                None => applied,
            };
        }
        self.format.set(Some(applied));
        debug!(node = %self.name, format = %applied.pixel_format, size = %applied.size, "Format set");
        Ok(applied)
    }

    fn format(&self) -> Option<VideoFormat> {
        self.format.get()
    }

    fn export_buffers(&self, count: u32) -> HalResult<Vec<FrameBuffer>> {
        let format = self
            .format
            .get()
            .ok_or_else(|| HalError::Configuration(format!("{}: no format set", self.name)))?;
        if count == 0 {
            return Err(HalError::InvalidRequest(format!("{}: zero buffers requested", self.name)));
        }
        let length = (format.frame_size as usize).max(1);
        Ok((0..count)
            .map(|_| FrameBuffer::new(vec![Plane::allocate(length)]))
            .collect())
    }

    fn queue_buffer(&self, buffer: &FrameBuffer) -> HalResult<()> {
        if let Some(errno) = self.queue_failure.take() {
            return Err(HalError::device(errno, format!("{}: VIDIOC_QBUF", self.name)));
        }
        self.queue.borrow_mut().push_back(buffer.clone());
        Ok(())
    }

    fn stream_on(&self) -> HalResult<()> {
        if self.streaming.replace(true) {
            return Ok(());
        }
        self.sequence.set(0);

        let weak = self.self_ref.clone();
        let id = self.event_loop.add_source(format!("{}:dqbuf", self.name), move || {
            match weak.upgrade() {
                Some(node) => node.poll(),
                None => SourceStatus::Disable,
            }
        });
        self.source.set(Some(id));
        debug!(node = %self.name, "Stream on");
        Ok(())
    }

    fn stream_off(&self) -> Vec<FrameBuffer> {
        self.streaming.set(false);
        if let Some(id) = self.source.take() {
            self.event_loop.remove_source(id);
        }

        let returned: Vec<FrameBuffer> = self.queue.borrow_mut().drain(..).collect();
        for buffer in &returned {
            buffer.cancel();
        }
        debug!(node = %self.name, returned = returned.len(), "Stream off");
        returned
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn queued_count(&self) -> usize {
        self.queue.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::Size;

    fn node_with_sink() -> (Rc<SimVideoNode>, EventLoop, Rc<RefCell<Vec<(String, FrameBuffer)>>>) {
        let event_loop = EventLoop::new();
        let node = SimVideoNode::new("capture", &event_loop, vec![PixelFormat::BGR888]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        node.set_event_sink(EventSink::new(&event_loop, move |event| {
            if let DeviceEvent::BufferReady { node, buffer } = event {
                record.borrow_mut().push((node, buffer));
            }
        }));
        node.set_format(&VideoFormat::new(PixelFormat::BGR888, Size::new(48, 48)))
            .unwrap();
        (node, event_loop, seen)
    }

    #[test]
    fn test_auto_mode_completes_in_fifo_order() {
        let (node, event_loop, seen) = node_with_sink();
        let buffers = node.export_buffers(3).unwrap();
        for buffer in &buffers {
            node.queue_buffer(buffer).unwrap();
        }
        node.stream_on().unwrap();

        assert!(event_loop.run_until(std::time::Duration::from_secs(1), || seen.borrow().len() == 3));
        let ids: Vec<_> = seen.borrow().iter().map(|(_, b)| b.id()).collect();
        assert_eq!(ids, buffers.iter().map(|b| b.id()).collect::<Vec<_>>());
        assert_eq!(seen.borrow()[2].1.metadata().sequence, 2);
    }

    #[test]
    fn test_manual_mode_out_of_order() {
        let (node, event_loop, seen) = node_with_sink();
        node.set_mode(CompletionMode::Manual);
        let buffers = node.export_buffers(2).unwrap();
        for buffer in &buffers {
            node.queue_buffer(buffer).unwrap();
        }
        node.stream_on().unwrap();

        assert!(node.complete_at(1, FrameStatus::Success));
        event_loop.dispatch_pending();
        assert_eq!(seen.borrow()[0].1.id(), buffers[1].id());
        assert_eq!(node.queued_count(), 1);
    }

    #[test]
    fn test_stream_off_cancels_queued() {
        let (node, _event_loop, _seen) = node_with_sink();
        node.set_mode(CompletionMode::Manual);
        let buffer = node.export_buffers(1).unwrap().remove(0);
        node.queue_buffer(&buffer).unwrap();
        node.stream_on().unwrap();

        let returned = node.stream_off();
        assert_eq!(returned.len(), 1);
        assert_eq!(buffer.metadata().status, FrameStatus::Cancelled);
        assert!(!node.is_streaming());
    }

    #[test]
    fn test_queue_failure_is_one_shot() {
        let (node, _event_loop, _seen) = node_with_sink();
        let buffer = node.export_buffers(1).unwrap().remove(0);
        node.fail_next_queue(libc::EIO);
        assert_eq!(node.queue_buffer(&buffer).unwrap_err().errno(), Some(-libc::EIO));
        assert!(node.queue_buffer(&buffer).is_ok());
    }
}
