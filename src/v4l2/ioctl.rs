// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 extended control and event ioctls
//!
//! The [`ControlIo`] trait is the hardware boundary of the control layer:
//! [`V4l2Node`] implements it with raw ioctls on a device node, the
//! simulated subdevices implement it in memory.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

// ===== V4L2 Control Class Bases =====
const V4L2_CTRL_CLASS_USER: u32 = 0x00980000;
const V4L2_CTRL_CLASS_IMAGE_SOURCE: u32 = 0x009e0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_IMAGE_SOURCE_CLASS_BASE: u32 = V4L2_CTRL_CLASS_IMAGE_SOURCE | 0x900;

// ===== V4L2 Control IDs =====

/// First id of the user control class
pub const V4L2_CID_USER_BASE: u32 = V4L2_CID_BASE;
/// Class marker of the user control class
pub const V4L2_CID_USER_CLASS: u32 = V4L2_CTRL_CLASS_USER | 1;

/// Brightness control
pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
/// Contrast control
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
/// Saturation control
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
/// Hue control
pub const V4L2_CID_HUE: u32 = V4L2_CID_BASE + 3;
/// Exposure in lines (user class)
pub const V4L2_CID_EXPOSURE: u32 = V4L2_CID_BASE + 17;
/// Gain control
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
/// Analogue gain (image source class)
pub const V4L2_CID_ANALOGUE_GAIN: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 3;

// ===== V4L2 Control Types =====
pub const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
pub const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
pub const V4L2_CTRL_TYPE_MENU: u32 = 3;
pub const V4L2_CTRL_TYPE_BUTTON: u32 = 4;
pub const V4L2_CTRL_TYPE_INTEGER64: u32 = 5;
pub const V4L2_CTRL_TYPE_CTRL_CLASS: u32 = 6;
pub const V4L2_CTRL_TYPE_STRING: u32 = 7;
pub const V4L2_CTRL_TYPE_BITMASK: u32 = 8;
pub const V4L2_CTRL_TYPE_INTEGER_MENU: u32 = 9;
pub const V4L2_CTRL_TYPE_U8: u32 = 0x0100;

// ===== V4L2 Control Flags =====
pub const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
pub const V4L2_CTRL_FLAG_READ_ONLY: u32 = 0x0004;
pub const V4L2_CTRL_FLAG_HAS_PAYLOAD: u32 = 0x0100;
pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x80000000;
pub const V4L2_CTRL_FLAG_NEXT_COMPOUND: u32 = 0x40000000;

const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;

// ===== V4L2 Events =====
pub const V4L2_EVENT_VSYNC: u32 = 1;
pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_CTRL: u32 = 3;
pub const V4L2_EVENT_FRAME_SYNC: u32 = 4;

// ===== V4L2 ioctl Numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE

/// Query extended control info (v4l2_query_ext_ctrl: 232 bytes)
const VIDIOC_QUERY_EXT_CTRL: libc::c_ulong = 0xC0E85667;
/// Get extended controls (v4l2_ext_controls: 32 bytes)
const VIDIOC_G_EXT_CTRLS: libc::c_ulong = 0xC0205647;
/// Set extended controls (v4l2_ext_controls: 32 bytes)
const VIDIOC_S_EXT_CTRLS: libc::c_ulong = 0xC0205648;
/// Dequeue an event (v4l2_event: 136 bytes)
const VIDIOC_DQEVENT: libc::c_ulong = 0x80885659;
/// Subscribe to an event (v4l2_event_subscription: 32 bytes)
const VIDIOC_SUBSCRIBE_EVENT: libc::c_ulong = 0x4020565A;
/// Unsubscribe from an event (v4l2_event_subscription: 32 bytes)
const VIDIOC_UNSUBSCRIBE_EVENT: libc::c_ulong = 0x4020565B;

// ===== V4L2 ioctl Structures =====

#[repr(C)]
struct V4l2QueryExtCtrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i64,
    maximum: i64,
    step: u64,
    default_value: i64,
    flags: u32,
    elem_size: u32,
    elems: u32,
    nr_of_dims: u32,
    dims: [u32; 4],
    reserved: [u32; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2ExtValue {
    value: i32,
    value64: i64,
    ptr: *mut libc::c_void,
}

#[repr(C, packed)]
struct V4l2ExtControl {
    id: u32,
    size: u32,
    reserved2: [u32; 1],
    value: V4l2ExtValue,
}

#[repr(C)]
struct V4l2ExtControls {
    which: u32,
    count: u32,
    error_idx: u32,
    request_fd: i32,
    reserved: [u32; 1],
    controls: *mut V4l2ExtControl,
}

#[repr(C)]
struct V4l2EventSubscription {
    event_type: u32,
    id: u32,
    flags: u32,
    reserved: [u32; 5],
}

#[repr(C, align(8))]
struct V4l2EventData {
    data: [u8; 64],
}

#[repr(C)]
struct V4l2Event {
    event_type: u32,
    u: V4l2EventData,
    pending: u32,
    sequence: u32,
    timestamp: libc::timespec,
    id: u32,
    reserved: [u32; 8],
}

// ===== Safe Representations =====

/// Result of VIDIOC_QUERY_EXT_CTRL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExtCtrl {
    pub id: u32,
    pub ctrl_type: u32,
    pub name: String,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
}

impl QueryExtCtrl {
    pub fn is_disabled(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_DISABLED != 0
    }

    /// Controls whose value travels through a payload pointer
    pub fn has_payload(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_HAS_PAYLOAD != 0
    }
}

/// Value slot of one extended control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Int(i32),
    Int64(i64),
    Bytes(Vec<u8>),
}

/// One entry of an extended control array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawControl {
    pub id: u32,
    pub payload: RawPayload,
}

/// Failure of a G/S_EXT_CTRLS call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtControlError {
    /// Index reported by the kernel; equals the count when nothing was touched
    pub error_idx: u32,
    /// Positive errno
    pub errno: i32,
}

/// Dequeued event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: u32,
    /// Frame sequence for FRAME_SYNC events
    pub frame_sequence: u32,
    pub sequence: u32,
}

/// Control and event interface of a V4L2 device or subdevice
pub trait ControlIo {
    fn name(&self) -> &str;

    /// Query one control; `id` may carry the NEXT_CTRL/NEXT_COMPOUND flags
    fn query_ext_ctrl(&self, id: u32) -> io::Result<QueryExtCtrl>;

    fn get_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError>;

    fn set_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError>;

    fn subscribe_event(&self, event_type: u32) -> io::Result<()>;

    fn unsubscribe_event(&self, event_type: u32) -> io::Result<()>;

    fn dequeue_event(&self) -> io::Result<RawEvent>;

    /// Whether an event is ready to be dequeued, without blocking
    fn event_pending(&self) -> io::Result<bool>;
}

/// Extract a null-terminated string from a fixed-size byte array
fn extract_name(bytes: &[u8; 32]) -> String {
    let name_len = bytes.iter().position(|&c| c == 0).unwrap_or(32);
    String::from_utf8_lossy(&bytes[..name_len]).to_string()
}

fn last_errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// A V4L2 video or subdevice node opened on the filesystem
pub struct V4l2Node {
    path: PathBuf,
    name: String,
    file: File,
}

impl V4l2Node {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            // DQEVENT must never stall the event loop
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        debug!(path = %path.display(), "Opened V4L2 node");
        Ok(Self { path, name, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ext_ctrls(&self, request: libc::c_ulong, ctrls: &mut [RawControl]) -> Result<(), ExtControlError> {
        let count = ctrls.len() as u32;
        // Byte payloads are read and written in place through these buffers
        let mut payloads: Vec<Vec<u8>> = ctrls
            .iter_mut()
            .map(|c| match &mut c.payload {
                RawPayload::Bytes(b) => std::mem::take(b),
                _ => Vec::new(),
            })
            .collect();

        let mut raw: Vec<V4l2ExtControl> = ctrls
            .iter()
            .zip(payloads.iter_mut())
            .map(|(c, payload)| {
                let (size, value) = match &c.payload {
                    RawPayload::Int(v) => (0, V4l2ExtValue { value: *v }),
                    RawPayload::Int64(v) => (0, V4l2ExtValue { value64: *v }),
                    RawPayload::Bytes(_) => (
                        payload.len() as u32,
                        V4l2ExtValue {
                            ptr: payload.as_mut_ptr() as *mut libc::c_void,
                        },
                    ),
                };
                V4l2ExtControl {
                    id: c.id,
                    size,
                    reserved2: [0],
                    value,
                }
            })
            .collect();

        let mut ext = V4l2ExtControls {
            which: V4L2_CTRL_WHICH_CUR_VAL,
            count,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: raw.as_mut_ptr(),
        };

        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request,
                &mut ext as *mut V4l2ExtControls,
            )
        };
        let failure = if result < 0 {
            Some(ExtControlError {
                error_idx: ext.error_idx,
                errno: last_errno(),
            })
        } else {
            None
        };

        // Copy back everything the driver may have written
        for ((ctrl, raw), payload) in ctrls.iter_mut().zip(raw.iter()).zip(payloads) {
            let value = raw.value;
            ctrl.payload = match &ctrl.payload {
                RawPayload::Int(_) => RawPayload::Int(unsafe { value.value }),
                RawPayload::Int64(_) => RawPayload::Int64(unsafe { value.value64 }),
                RawPayload::Bytes(_) => RawPayload::Bytes(payload),
            };
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subscription(&self, request: libc::c_ulong, event_type: u32) -> io::Result<()> {
        let mut sub = V4l2EventSubscription {
            event_type,
            id: 0,
            flags: 0,
            reserved: [0; 5],
        };
        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request,
                &mut sub as *mut V4l2EventSubscription,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ControlIo for V4l2Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_ext_ctrl(&self, id: u32) -> io::Result<QueryExtCtrl> {
        let mut query = V4l2QueryExtCtrl {
            id,
            ctrl_type: 0,
            name: [0; 32],
            minimum: 0,
            maximum: 0,
            step: 0,
            default_value: 0,
            flags: 0,
            elem_size: 0,
            elems: 0,
            nr_of_dims: 0,
            dims: [0; 4],
            reserved: [0; 32],
        };

        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                VIDIOC_QUERY_EXT_CTRL,
                &mut query as *mut V4l2QueryExtCtrl,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(QueryExtCtrl {
            id: query.id,
            ctrl_type: query.ctrl_type,
            name: extract_name(&query.name),
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default_value: query.default_value,
            flags: query.flags,
            elem_size: query.elem_size,
            elems: query.elems,
        })
    }

    fn get_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError> {
        self.ext_ctrls(VIDIOC_G_EXT_CTRLS, ctrls)
    }

    fn set_ext_ctrls(&self, ctrls: &mut [RawControl]) -> Result<(), ExtControlError> {
        self.ext_ctrls(VIDIOC_S_EXT_CTRLS, ctrls)
    }

    fn subscribe_event(&self, event_type: u32) -> io::Result<()> {
        self.subscription(VIDIOC_SUBSCRIBE_EVENT, event_type)
    }

    fn unsubscribe_event(&self, event_type: u32) -> io::Result<()> {
        self.subscription(VIDIOC_UNSUBSCRIBE_EVENT, event_type)
    }

    fn dequeue_event(&self) -> io::Result<RawEvent> {
        let mut event = V4l2Event {
            event_type: 0,
            u: V4l2EventData { data: [0; 64] },
            pending: 0,
            sequence: 0,
            timestamp: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            id: 0,
            reserved: [0; 8],
        };

        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                VIDIOC_DQEVENT,
                &mut event as *mut V4l2Event,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let d = &event.u.data;
        Ok(RawEvent {
            event_type: event.event_type,
            frame_sequence: u32::from_ne_bytes([d[0], d[1], d[2], d[3]]),
            sequence: event.sequence,
        })
    }

    fn event_pending(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        let result = unsafe { libc::poll(&mut pfd, 1, 0) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pfd.revents & libc::POLLPRI != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_id_values() {
        assert_eq!(V4L2_CID_BRIGHTNESS, 0x00980900);
        assert_eq!(V4L2_CID_CONTRAST, 0x00980901);
        assert_eq!(V4L2_CID_SATURATION, 0x00980902);
        assert_eq!(V4L2_CID_EXPOSURE, 0x00980911);
        assert_eq!(V4L2_CID_ANALOGUE_GAIN, 0x009e0903);
    }

    #[test]
    fn test_struct_layouts_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<V4l2QueryExtCtrl>(), 232);
        assert_eq!(std::mem::size_of::<V4l2ExtControl>(), 20);
        assert_eq!(std::mem::size_of::<V4l2ExtControls>(), 32);
        assert_eq!(std::mem::size_of::<V4l2EventSubscription>(), 32);
        assert_eq!(std::mem::size_of::<V4l2Event>(), 136);
    }

    #[test]
    fn test_ioctl_sizes_encoded() {
        assert_eq!((VIDIOC_QUERY_EXT_CTRL >> 16) & 0x3fff, 232);
        assert_eq!((VIDIOC_DQEVENT >> 16) & 0x3fff, 136);
        assert_eq!((VIDIOC_G_EXT_CTRLS >> 16) & 0x3fff, 32);
    }

    #[test]
    fn test_extract_name() {
        let mut bytes = [0u8; 32];
        bytes[..10].copy_from_slice(b"Brightness");
        assert_eq!(extract_name(&bytes), "Brightness");
    }

    #[test]
    fn test_open_missing_node_fails() {
        assert!(V4l2Node::open("/nonexistent/video99").is_err());
    }
}
