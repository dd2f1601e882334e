// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame join tracker
//!
//! A frame on an ISP pipeline needs a parameter buffer and a statistics
//! buffer besides the application's output buffer. Both come from fixed
//! internal pools and complete independently: the parameter buffer when the
//! ISP has consumed it, the statistics when the algorithm has turned them
//! into metadata. A frame is done once both have arrived, in any order.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::core::framebuffer::{BufferId, FrameBuffer};
use crate::core::request::Request;
use crate::errors::{HalError, HalResult};
use crate::signal::Signal;

/// Book-keeping for one in-flight frame
#[derive(Debug)]
pub struct FrameInfo {
    pub id: u32,
    pub request: Request,
    pub param_buffer: FrameBuffer,
    pub stat_buffer: FrameBuffer,
    /// Application output buffer, once the request's buffer is known
    pub raw_buffer: Option<FrameBuffer>,
    pub param_dequeued: bool,
    pub metadata_processed: bool,
}

/// Join barrier over the auxiliary buffers of in-flight frames
#[derive(Default)]
pub struct FrameTracker {
    frames: BTreeMap<u32, FrameInfo>,
    param_pool: VecDeque<FrameBuffer>,
    stat_pool: VecDeque<FrameBuffer>,
    next_id: u32,
    buffer_available: Signal<()>,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the pools and restart frame numbering
    pub fn init(&mut self, params: Vec<FrameBuffer>, stats: Vec<FrameBuffer>) {
        self.frames.clear();
        self.param_pool = params.into();
        self.stat_pool = stats.into();
        self.next_id = 0;
        debug!(
            params = self.param_pool.len(),
            stats = self.stat_pool.len(),
            "Frame tracker initialised"
        );
    }

    /// Drop every frame and both pools
    pub fn clear(&mut self) {
        self.frames.clear();
        self.param_pool.clear();
        self.stat_pool.clear();
    }

    /// Emitted whenever a frame returns its buffers to the pools
    pub fn buffer_available(&self) -> &Signal<()> {
        &self.buffer_available
    }

    pub fn available(&self) -> (usize, usize) {
        (self.param_pool.len(), self.stat_pool.len())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Start tracking a frame for `request`
    ///
    /// Takes one buffer from each pool. Nothing is taken when either pool
    /// is empty.
    pub fn create(&mut self, request: &Request) -> HalResult<u32> {
        if self.param_pool.is_empty() {
            return Err(HalError::Resource("parameters buffer underrun".into()));
        }
        if self.stat_pool.is_empty() {
            return Err(HalError::Resource("statistics buffer underrun".into()));
        }
        let (Some(param_buffer), Some(stat_buffer)) =
            (self.param_pool.pop_front(), self.stat_pool.pop_front())
        else {
            return Err(HalError::Resource("buffer pool underrun".into()));
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        trace!(frame = id, request = %request.id(), "Frame created");

        self.frames.insert(
            id,
            FrameInfo {
                id,
                request: request.clone(),
                param_buffer,
                stat_buffer,
                raw_buffer: None,
                param_dequeued: false,
                metadata_processed: false,
            },
        );
        Ok(id)
    }

    /// Stop tracking a frame, returning its buffers to the pools
    pub fn remove(&mut self, id: u32) -> Option<FrameInfo> {
        let info = self.frames.remove(&id)?;
        self.param_pool.push_back(info.param_buffer.clone());
        self.stat_pool.push_back(info.stat_buffer.clone());
        trace!(frame = id, "Frame removed");
        self.buffer_available.emit(&());
        Some(info)
    }

    /// Whether both auxiliary completions arrived for the frame
    pub fn try_complete(&self, id: u32) -> bool {
        self.frames
            .get(&id)
            .is_some_and(|info| info.param_dequeued && info.metadata_processed)
    }

    pub fn find(&self, id: u32) -> Option<&FrameInfo> {
        self.frames.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut FrameInfo> {
        self.frames.get_mut(&id)
    }

    /// Frame owning a parameter, statistics or output buffer
    pub fn find_by_buffer(&self, buffer: BufferId) -> Option<u32> {
        self.frames
            .values()
            .find(|info| {
                info.param_buffer.id() == buffer
                    || info.stat_buffer.id() == buffer
                    || info.raw_buffer.as_ref().is_some_and(|b| b.id() == buffer)
            })
            .map(|info| info.id)
    }

    pub fn find_by_request(&self, request: &Request) -> Option<u32> {
        self.frames
            .values()
            .find(|info| info.request == *request)
            .map(|info| info.id)
    }

    /// Ids of every tracked frame, oldest first
    pub fn frame_ids(&self) -> Vec<u32> {
        self.frames.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn pool(n: usize) -> Vec<FrameBuffer> {
        (0..n).map(|_| FrameBuffer::allocate(&[16])).collect()
    }

    fn tracker(n: usize) -> FrameTracker {
        let mut tracker = FrameTracker::new();
        tracker.init(pool(n), pool(n));
        tracker
    }

    #[test]
    fn test_create_takes_one_buffer_from_each_pool() {
        let mut tracker = tracker(2);
        let request = Request::new("cam", 0);
        let id = tracker.create(&request).unwrap();
        assert_eq!(id, 0);
        assert_eq!(tracker.available(), (1, 1));
        assert_eq!(tracker.find_by_request(&request), Some(0));
    }

    #[test]
    fn test_create_fails_without_consuming_on_empty_pool() {
        let mut tracker = FrameTracker::new();
        tracker.init(pool(1), Vec::new());
        let err = tracker.create(&Request::new("cam", 0)).unwrap_err();
        assert!(matches!(err, HalError::Resource(_)));
        assert_eq!(tracker.available(), (1, 0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_join_is_order_independent() {
        let mut tracker = tracker(2);
        let a = tracker.create(&Request::new("cam", 0)).unwrap();
        let b = tracker.create(&Request::new("cam", 1)).unwrap();

        assert!(!tracker.try_complete(a));
        tracker.find_mut(a).unwrap().param_dequeued = true;
        assert!(!tracker.try_complete(a));
        tracker.find_mut(a).unwrap().metadata_processed = true;
        assert!(tracker.try_complete(a));

        tracker.find_mut(b).unwrap().metadata_processed = true;
        assert!(!tracker.try_complete(b));
        tracker.find_mut(b).unwrap().param_dequeued = true;
        assert!(tracker.try_complete(b));
    }

    #[test]
    fn test_remove_returns_buffers_and_signals() {
        let mut tracker = tracker(1);
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let _sub = tracker
            .buffer_available()
            .connect(move |_| counter.set(counter.get() + 1));

        let id = tracker.create(&Request::new("cam", 0)).unwrap();
        assert!(tracker.create(&Request::new("cam", 1)).is_err());

        let info = tracker.remove(id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(fired.get(), 1);
        assert_eq!(tracker.available(), (1, 1));
        assert!(tracker.remove(id).is_none());
        assert_eq!(tracker.create(&Request::new("cam", 2)).unwrap(), 1);
    }

    #[test]
    fn test_find_by_buffer_matches_auxiliary_buffers() {
        let mut tracker = tracker(1);
        let id = tracker.create(&Request::new("cam", 0)).unwrap();
        let stat = tracker.find(id).unwrap().stat_buffer.id();
        let param = tracker.find(id).unwrap().param_buffer.id();
        assert_eq!(tracker.find_by_buffer(stat), Some(id));
        assert_eq!(tracker.find_by_buffer(param), Some(id));
        assert_eq!(tracker.find_by_buffer(FrameBuffer::allocate(&[1]).id()), None);
    }
}
