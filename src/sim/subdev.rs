// SPDX-License-Identifier: GPL-3.0-only

//! In-memory V4L2 subdevice
//!
//! Answers the extended control and event ioctls the way a driver would:
//! integer writes are clamped, unknown ids fail validation before anything
//! is written, and an injected failure at index `k` leaves controls
//! `[0, k)` applied.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;

use tracing::trace;

use crate::v4l2::ioctl::*;

/// Description of a simulated control
#[derive(Debug, Clone)]
pub struct SimControl {
    pub id: u32,
    pub name: &'static str,
    pub ctrl_type: u32,
    pub minimum: i64,
    pub maximum: i64,
    pub default_value: i64,
    pub flags: u32,
    /// Element count for array controls
    pub elems: u32,
}

impl SimControl {
    pub fn integer(id: u32, name: &'static str, minimum: i64, maximum: i64, default_value: i64) -> Self {
        Self {
            id,
            name,
            ctrl_type: V4L2_CTRL_TYPE_INTEGER,
            minimum,
            maximum,
            default_value,
            flags: 0,
            elems: 1,
        }
    }

    pub fn boolean(id: u32, name: &'static str, default_value: bool) -> Self {
        Self {
            ctrl_type: V4L2_CTRL_TYPE_BOOLEAN,
            ..Self::integer(id, name, 0, 1, i64::from(default_value))
        }
    }

    pub fn integer64(id: u32, name: &'static str, minimum: i64, maximum: i64, default_value: i64) -> Self {
        Self {
            ctrl_type: V4L2_CTRL_TYPE_INTEGER64,
            ..Self::integer(id, name, minimum, maximum, default_value)
        }
    }

    pub fn byte_array(id: u32, name: &'static str, elems: u32) -> Self {
        Self {
            ctrl_type: V4L2_CTRL_TYPE_U8,
            flags: V4L2_CTRL_FLAG_HAS_PAYLOAD,
            elems,
            ..Self::integer(id, name, 0, 255, 0)
        }
    }

    pub fn class(id: u32, name: &'static str) -> Self {
        Self {
            ctrl_type: V4L2_CTRL_TYPE_CTRL_CLASS,
            flags: V4L2_CTRL_FLAG_READ_ONLY,
            ..Self::integer(id, name, 0, 0, 0)
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    fn query(&self) -> QueryExtCtrl {
        QueryExtCtrl {
            id: self.id,
            ctrl_type: self.ctrl_type,
            name: self.name.to_string(),
            minimum: self.minimum,
            maximum: self.maximum,
            step: 1,
            default_value: self.default_value,
            flags: self.flags,
            elem_size: if self.ctrl_type == V4L2_CTRL_TYPE_U8 { 1 } else { 0 },
            elems: self.elems,
        }
    }

    fn initial_value(&self) -> RawPayload {
        match self.ctrl_type {
            V4L2_CTRL_TYPE_U8 => RawPayload::Bytes(vec![self.default_value as u8; self.elems as usize]),
            V4L2_CTRL_TYPE_INTEGER64 => RawPayload::Int64(self.default_value),
            _ => RawPayload::Int(self.default_value as i32),
        }
    }
}

struct Entry {
    control: SimControl,
    value: RawPayload,
}

/// Simulated sensor or ISP subdevice
pub struct SimSubdevice {
    name: String,
    controls: RefCell<BTreeMap<u32, Entry>>,
    set_failure: Cell<Option<(u32, i32)>>,
    get_failure: Cell<Option<(Option<u32>, i32)>>,
    subscribed: RefCell<BTreeSet<u32>>,
    events: RefCell<VecDeque<Result<RawEvent, i32>>>,
    event_sequence: Cell<u32>,
    writes: Cell<u32>,
}

impl SimSubdevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controls: RefCell::new(BTreeMap::new()),
            set_failure: Cell::new(None),
            get_failure: Cell::new(None),
            subscribed: RefCell::new(BTreeSet::new()),
            events: RefCell::new(VecDeque::new()),
            event_sequence: Cell::new(0),
            writes: Cell::new(0),
        }
    }

    pub fn with_control(self, control: SimControl) -> Self {
        self.add_control(control);
        self
    }

    pub fn add_control(&self, control: SimControl) {
        let value = control.initial_value();
        self.controls
            .borrow_mut()
            .insert(control.id, Entry { control, value });
    }

    /// Current integer value of a control
    pub fn value(&self, id: u32) -> Option<i64> {
        match &self.controls.borrow().get(&id)?.value {
            RawPayload::Int(v) => Some(i64::from(*v)),
            RawPayload::Int64(v) => Some(*v),
            RawPayload::Bytes(_) => None,
        }
    }

    pub fn bytes(&self, id: u32) -> Option<Vec<u8>> {
        match &self.controls.borrow().get(&id)?.value {
            RawPayload::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Number of successful or partial `S_EXT_CTRLS` calls
    pub fn write_count(&self) -> u32 {
        self.writes.get()
    }

    /// Make the next control write fail at `error_idx` with a positive errno
    pub fn fail_next_set(&self, error_idx: u32, errno: i32) {
        self.set_failure.set(Some((error_idx, errno)));
    }

    pub fn fail_next_get(&self, errno: i32) {
        self.get_failure.set(Some((None, errno)));
    }

    /// Make the next control read stop at `error_idx`, after filling the
    /// controls before it
    pub fn fail_next_get_at(&self, error_idx: u32, errno: i32) {
        self.get_failure.set(Some((Some(error_idx), errno)));
    }

    /// Make the next event dequeue fail
    pub fn fail_next_dequeue(&self, errno: i32) {
        self.events.borrow_mut().push_back(Err(errno));
    }

    pub fn is_subscribed(&self, event_type: u32) -> bool {
        self.subscribed.borrow().contains(&event_type)
    }

    /// Queue an event of any type, as long as it is subscribed
    pub fn push_event(&self, event_type: u32, frame_sequence: u32) {
        if !self.is_subscribed(event_type) {
            return;
        }
        let sequence = self.event_sequence.get();
        self.event_sequence.set(sequence.wrapping_add(1));
        self.events.borrow_mut().push_back(Ok(RawEvent {
            event_type,
            frame_sequence,
            sequence,
        }));
    }

    /// Signal the start of a frame
    pub fn frame_sync(&self, frame_sequence: u32) {
        self.push_event(V4L2_EVENT_FRAME_SYNC, frame_sequence);
    }

    pub fn pending_events(&self) -> usize {
        self.events.borrow().len()
    }

    fn clamp(control: &SimControl, payload: &RawPayload) -> Result<RawPayload, i32> {
        match (control.ctrl_type, payload) {
            (V4L2_CTRL_TYPE_U8, RawPayload::Bytes(bytes)) => {
                if bytes.len() != control.elems as usize {
                    return Err(libc::EINVAL);
                }
                Ok(RawPayload::Bytes(bytes.clone()))
            }
            (V4L2_CTRL_TYPE_INTEGER64, RawPayload::Int64(v)) => {
                Ok(RawPayload::Int64((*v).clamp(control.minimum, control.maximum)))
            }
            (V4L2_CTRL_TYPE_U8 | V4L2_CTRL_TYPE_INTEGER64, _) => Err(libc::EINVAL),
            (_, RawPayload::Int(v)) => Ok(RawPayload::Int(
                i64::from(*v).clamp(control.minimum, control.maximum) as i32,
            )),
            _ => Err(libc::EINVAL),
        }
    }
}

impl ControlIo for SimSubdevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_ext_ctrl(&self, id: u32) -> io::Result<QueryExtCtrl> {
        let controls = self.controls.borrow();
        let flags = V4L2_CTRL_FLAG_NEXT_CTRL | V4L2_CTRL_FLAG_NEXT_COMPOUND;
        let entry = if id & flags != 0 {
            let base = id & !flags;
            controls.range(base.saturating_add(1)..).next().map(|(_, e)| e)
        } else {
            controls.get(&id)
        };
        entry
            .map(|e| e.control.query())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn get_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError> {
        let count = ctrls.len() as u32;
        let (fail_at, errno) = match self.get_failure.take() {
            Some((None, errno)) => {
                return Err(ExtControlError {
                    error_idx: count,
                    errno,
                });
            }
            Some((Some(idx), errno)) => (idx.min(count), errno),
            None => (count, 0),
        };

        let controls = self.controls.borrow();
        for (i, ctrl) in ctrls.iter().enumerate() {
            if !controls.contains_key(&ctrl.id) {
                return Err(ExtControlError {
                    error_idx: i as u32,
                    errno: libc::EINVAL,
                });
            }
        }
        for ctrl in ctrls.iter_mut().take(fail_at as usize) {
            if let Some(entry) = controls.get(&ctrl.id) {
                ctrl.payload = entry.value.clone();
            }
        }
        if fail_at < count {
            return Err(ExtControlError {
                error_idx: fail_at,
                errno,
            });
        }
        Ok(())
    }

    fn set_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError> {
        let count = ctrls.len() as u32;
        let mut controls = self.controls.borrow_mut();

        // Validation touches nothing
        let mut clamped = Vec::with_capacity(ctrls.len());
        for ctrl in ctrls.iter() {
            let Some(entry) = controls.get(&ctrl.id) else {
                return Err(ExtControlError {
                    error_idx: count,
                    errno: libc::EINVAL,
                });
            };
            if entry.control.flags & V4L2_CTRL_FLAG_READ_ONLY != 0 {
                return Err(ExtControlError {
                    error_idx: count,
                    errno: libc::EACCES,
                });
            }
            match Self::clamp(&entry.control, &ctrl.payload) {
                Ok(value) => clamped.push(value),
                Err(errno) => {
                    return Err(ExtControlError {
                        error_idx: count,
                        errno,
                    });
                }
            }
        }

        let failure = self.set_failure.take();
        let applied = match failure {
            Some((idx, _)) if idx > 0 && idx < count => idx as usize,
            Some(_) => 0,
            None => ctrls.len(),
        };

        for (ctrl, value) in ctrls.iter_mut().zip(clamped).take(applied) {
            trace!(subdev = %self.name, id = %format!("{:#x}", ctrl.id), ?value, "Control written");
            if let Some(entry) = controls.get_mut(&ctrl.id) {
                entry.value = value.clone();
            }
            ctrl.payload = value;
        }
        if applied > 0 {
            self.writes.set(self.writes.get() + 1);
        }

        match failure {
            Some((error_idx, errno)) => Err(ExtControlError { error_idx, errno }),
            None => Ok(()),
        }
    }

    fn subscribe_event(&self, event_type: u32) -> io::Result<()> {
        self.subscribed.borrow_mut().insert(event_type);
        Ok(())
    }

    fn unsubscribe_event(&self, event_type: u32) -> io::Result<()> {
        self.subscribed.borrow_mut().remove(&event_type);
        self.events
            .borrow_mut()
            .retain(|e| e.as_ref().map_or(true, |ev| ev.event_type != event_type));
        Ok(())
    }

    fn dequeue_event(&self) -> io::Result<RawEvent> {
        match self.events.borrow_mut().pop_front() {
            Some(Ok(event)) => Ok(event),
            Some(Err(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn event_pending(&self) -> io::Result<bool> {
        Ok(!self.events.borrow().is_empty())
    }
}
