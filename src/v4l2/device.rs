// SPDX-License-Identifier: GPL-3.0-only

//! Typed control access and event bridging for one V4L2 (sub)device
//!
//! ```text
//!   ControlList ──set_controls──► RawControl[] ──S_EXT_CTRLS──► driver
//!   ControlList ◄─get_controls─── RawControl[] ◄─G_EXT_CTRLS───
//!
//!   event fd readiness ──► dequeue one event ──► FRAME_SYNC ──► frame_start(seq)
//!                                          └───► anything else: notifier disabled
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use super::ioctl::*;
use crate::core::controls::{ControlId, ControlInfo, ControlInfoMap, ControlList, ControlType, ControlValue};
use crate::errors::{HalError, HalResult};
use crate::event_loop::{EventLoop, SourceId, SourceStatus};
use crate::signal::Signal;

/// Cached description of one kernel control
#[derive(Debug, Clone, PartialEq)]
pub struct V4l2ControlInfo {
    pub id: u32,
    pub name: String,
    pub v4l2_type: u32,
    pub control_type: ControlType,
    pub info: ControlInfo,
    pub elem_size: u32,
    pub elems: u32,
    pub flags: u32,
}

impl V4l2ControlInfo {
    fn from_query(query: &QueryExtCtrl) -> Option<Self> {
        let control_type = match query.ctrl_type {
            V4L2_CTRL_TYPE_U8 => ControlType::Byte,
            V4L2_CTRL_TYPE_BOOLEAN => ControlType::Bool,
            V4L2_CTRL_TYPE_INTEGER64 => ControlType::Int64,
            V4L2_CTRL_TYPE_INTEGER
            | V4L2_CTRL_TYPE_MENU
            | V4L2_CTRL_TYPE_BUTTON
            | V4L2_CTRL_TYPE_BITMASK
            | V4L2_CTRL_TYPE_INTEGER_MENU => ControlType::Int32,
            _ => return None,
        };

        let info = match control_type {
            ControlType::Bool => ControlInfo::new(
                query.minimum != 0,
                query.maximum != 0,
                query.default_value != 0,
            ),
            ControlType::Byte => ControlInfo::new(
                query.minimum.clamp(0, 255) as u8,
                query.maximum.clamp(0, 255) as u8,
                query.default_value.clamp(0, 255) as u8,
            ),
            ControlType::Int64 => {
                ControlInfo::new(query.minimum, query.maximum, query.default_value)
            }
            _ => ControlInfo::new(
                query.minimum as i32,
                query.maximum as i32,
                query.default_value as i32,
            ),
        };

        Some(Self {
            id: query.id,
            name: query.name.clone(),
            v4l2_type: query.ctrl_type,
            control_type,
            info,
            elem_size: query.elem_size,
            elems: query.elems.max(1),
            flags: query.flags,
        })
    }

    /// Byte controls always travel as arrays
    pub fn is_array(&self) -> bool {
        self.control_type == ControlType::Byte
    }

    pub fn payload_len(&self) -> usize {
        (self.elems * self.elem_size.max(1)) as usize
    }

    fn empty_payload(&self) -> RawPayload {
        match self.control_type {
            ControlType::Byte => RawPayload::Bytes(vec![0; self.payload_len()]),
            ControlType::Int64 => RawPayload::Int64(0),
            _ => RawPayload::Int(0),
        }
    }

    fn to_value(&self, payload: RawPayload) -> ControlValue {
        match (self.control_type, payload) {
            (ControlType::Bool, RawPayload::Int(v)) => ControlValue::Bool(v != 0),
            (ControlType::Int64, RawPayload::Int64(v)) => ControlValue::Int64(v),
            (_, RawPayload::Bytes(b)) => ControlValue::Bytes(b),
            (_, RawPayload::Int(v)) => ControlValue::Int32(v),
            (_, RawPayload::Int64(v)) => ControlValue::Int64(v),
        }
    }

    fn to_payload(&self, value: &ControlValue) -> Option<RawPayload> {
        match self.control_type {
            ControlType::Byte => match value {
                ControlValue::Bytes(b) if b.len() == self.payload_len() => {
                    Some(RawPayload::Bytes(b.clone()))
                }
                _ => None,
            },
            ControlType::Int64 => value.as_i64().map(RawPayload::Int64),
            _ => match value {
                ControlValue::Bytes(_) | ControlValue::String(_) | ControlValue::None => None,
                other => other.as_i32().map(RawPayload::Int),
            },
        }
    }
}

/// Result of a control write that reached the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Every control was written
    Applied,
    /// Controls before `failed_at` were written, the rest untouched
    Partial { failed_at: usize, errno: i32 },
}

/// Control and event access to one V4L2 device or subdevice
pub struct V4l2Device {
    io: Rc<dyn ControlIo>,
    event_loop: EventLoop,
    controls: BTreeMap<u32, V4l2ControlInfo>,
    info_map: ControlInfoMap,
    frame_start: Rc<Signal<u32>>,
    notifier: RefCell<Option<SourceId>>,
    notifier_active: Rc<Cell<bool>>,
}

impl V4l2Device {
    /// Wrap a node and enumerate its controls
    pub fn open(io: Rc<dyn ControlIo>, event_loop: &EventLoop) -> HalResult<Self> {
        let controls = list_controls(io.as_ref());
        let mut info_map = ControlInfoMap::new();
        for (id, ctrl) in &controls {
            info_map.insert(*id, ctrl.info.clone());
        }
        info!(device = %io.name(), controls = controls.len(), "V4L2 device opened");

        Ok(Self {
            io,
            event_loop: event_loop.clone(),
            controls,
            info_map,
            frame_start: Rc::new(Signal::new()),
            notifier: RefCell::new(None),
            notifier_active: Rc::new(Cell::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        self.io.name()
    }

    /// Supported controls keyed by kernel control id
    pub fn control_info_map(&self) -> &ControlInfoMap {
        &self.info_map
    }

    pub fn control_info(&self, id: u32) -> Option<&V4l2ControlInfo> {
        self.controls.get(&id)
    }

    pub fn control_infos(&self) -> impl Iterator<Item = &V4l2ControlInfo> {
        self.controls.values()
    }

    /// Read the current value of the given controls
    ///
    /// Unknown ids make the whole read fail with an empty list. When the
    /// driver stops at a specific control, the values read before it are
    /// returned.
    pub fn get_controls(&self, ids: &[ControlId]) -> HalResult<ControlList> {
        if ids.is_empty() {
            return Ok(ControlList::new());
        }

        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            match self.controls.get(id) {
                Some(info) => infos.push(info),
                None => {
                    error!(device = %self.name(), id = %format!("{:#x}", id), "Control not found");
                    return Ok(ControlList::new());
                }
            }
        }

        let mut raw: Vec<RawControl> = infos
            .iter()
            .map(|info| RawControl {
                id: info.id,
                payload: info.empty_payload(),
            })
            .collect();

        if let Err(err) = self.io.get_ext_ctrls(&mut raw) {
            let count = raw.len() as u32;
            if err.error_idx == 0 || err.error_idx >= count {
                error!(device = %self.name(), errno = err.errno, "Unable to read controls");
                return Err(HalError::device(err.errno, "VIDIOC_G_EXT_CTRLS"));
            }

            error!(
                device = %self.name(),
                errno = err.errno,
                failed_at = err.error_idx,
                "Unable to read control"
            );
            infos.truncate(err.error_idx as usize);
            raw.truncate(err.error_idx as usize);
        }

        Ok(infos
            .into_iter()
            .zip(raw)
            .map(|(info, ctrl)| (info.id, info.to_value(ctrl.payload)))
            .collect())
    }

    /// Write controls, reading back what the driver applied
    ///
    /// Every id and value is validated before the driver is touched. On a
    /// partial failure the entries before the failing index hold the values
    /// the driver applied and the remaining entries are left as passed in.
    pub fn set_controls(&self, ctrls: &mut ControlList) -> HalResult<SetOutcome> {
        if ctrls.is_empty() {
            return Ok(SetOutcome::Applied);
        }

        let mut raw = Vec::with_capacity(ctrls.len());
        for (id, value) in ctrls.iter() {
            let Some(info) = self.controls.get(&id) else {
                error!(device = %self.name(), id = %format!("{:#x}", id), "Control not found");
                return Err(HalError::NotFound(format!(
                    "{}: control {:#x}",
                    self.name(),
                    id
                )));
            };
            let Some(payload) = info.to_payload(value) else {
                error!(device = %self.name(), control = %info.name, %value, "Invalid control value");
                return Err(HalError::InvalidRequest(format!(
                    "{}: invalid value {} for {}",
                    self.name(),
                    value,
                    info.name
                )));
            };
            raw.push(RawControl { id, payload });
        }

        let count = raw.len();
        match self.io.set_ext_ctrls(&mut raw) {
            Ok(()) => {
                self.update_controls(ctrls, raw);
                Ok(SetOutcome::Applied)
            }
            Err(err) => {
                let idx = err.error_idx as usize;
                if idx == 0 || idx >= count {
                    error!(device = %self.name(), errno = err.errno, "Unable to set controls");
                    return Err(HalError::device(err.errno, "VIDIOC_S_EXT_CTRLS"));
                }

                warn!(
                    device = %self.name(),
                    errno = err.errno,
                    failed_at = idx,
                    count,
                    "Unable to set control, earlier controls applied"
                );
                raw.truncate(idx);
                self.update_controls(ctrls, raw);
                Ok(SetOutcome::Partial {
                    failed_at: idx,
                    errno: -err.errno.abs(),
                })
            }
        }
    }

    fn update_controls(&self, ctrls: &mut ControlList, raw: Vec<RawControl>) {
        for ctrl in raw {
            if let Some(info) = self.controls.get(&ctrl.id) {
                ctrls.set(ctrl.id, info.to_value(ctrl.payload));
            }
        }
    }

    /// Signal emitted with the frame sequence on every start-of-frame event
    pub fn frame_start(&self) -> &Signal<u32> {
        &self.frame_start
    }

    pub fn is_frame_start_enabled(&self) -> bool {
        self.notifier_active.get()
    }

    /// Subscribe to start-of-frame events and watch the node for them
    pub fn set_frame_start_enabled(&self, enable: bool) -> HalResult<()> {
        if !enable {
            if self.notifier.borrow().is_none() {
                return Ok(());
            }
            self.disable_notifier();
            return self
                .io
                .unsubscribe_event(V4L2_EVENT_FRAME_SYNC)
                .map_err(HalError::from);
        }
        if self.notifier_active.get() {
            return Ok(());
        }

        self.disable_notifier();
        self.io
            .subscribe_event(V4L2_EVENT_FRAME_SYNC)
            .map_err(|e| {
                error!(device = %self.name(), %e, "Failed to subscribe to frame start events");
                HalError::from(e)
            })?;

        let io = self.io.clone();
        let frame_start = self.frame_start.clone();
        let active = self.notifier_active.clone();
        active.set(true);

        let id = self
            .event_loop
            .add_source(format!("{}:events", self.name()), move || {
                if !active.get() {
                    return SourceStatus::Disable;
                }
                match io.event_pending() {
                    Ok(true) => {}
                    Ok(false) => return SourceStatus::Idle,
                    Err(e) => {
                        error!(device = %io.name(), %e, "Event readiness check failed, disabling notifier");
                        active.set(false);
                        return SourceStatus::Disable;
                    }
                }

                match io.dequeue_event() {
                    Err(e) => {
                        error!(device = %io.name(), %e, "Failed to dequeue event, disabling event notifier");
                        active.set(false);
                        SourceStatus::Disable
                    }
                    Ok(event) if event.event_type != V4L2_EVENT_FRAME_SYNC => {
                        error!(
                            device = %io.name(),
                            event_type = event.event_type,
                            "Spurious event, disabling event notifier"
                        );
                        active.set(false);
                        SourceStatus::Disable
                    }
                    Ok(event) => {
                        debug!(device = %io.name(), sequence = event.frame_sequence, "Frame start");
                        frame_start.emit(&event.frame_sequence);
                        SourceStatus::Dispatched
                    }
                }
            });
        *self.notifier.borrow_mut() = Some(id);
        Ok(())
    }

    fn disable_notifier(&self) {
        self.notifier_active.set(false);
        if let Some(id) = self.notifier.borrow_mut().take() {
            self.event_loop.remove_source(id);
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if self.notifier.borrow().is_some() {
            self.disable_notifier();
            let _ = self.io.unsubscribe_event(V4L2_EVENT_FRAME_SYNC);
        }
    }
}

/// Enumerate the supported controls of a node
///
/// Class markers, disabled controls and unsupported types are skipped.
pub fn list_controls(io: &dyn ControlIo) -> BTreeMap<u32, V4l2ControlInfo> {
    let mut controls = BTreeMap::new();
    let mut id = 0u32;

    loop {
        let query = match io.query_ext_ctrl(id | V4L2_CTRL_FLAG_NEXT_CTRL | V4L2_CTRL_FLAG_NEXT_COMPOUND) {
            Ok(query) => query,
            Err(_) => break,
        };
        id = query.id;

        if query.ctrl_type == V4L2_CTRL_TYPE_CTRL_CLASS || query.is_disabled() {
            continue;
        }

        match V4l2ControlInfo::from_query(&query) {
            Some(info) => {
                debug!(device = %io.name(), control = %info.name, id = %format!("{:#x}", id), "Control found");
                controls.insert(id, info);
            }
            None => {
                debug!(
                    device = %io.name(),
                    control = %query.name,
                    ctrl_type = query.ctrl_type,
                    "Control has unsupported type"
                );
            }
        }
    }

    controls
}
