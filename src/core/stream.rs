// SPDX-License-Identifier: GPL-3.0-only

//! Streams and camera configurations

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

// ===== Geometry =====

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_null(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Round both dimensions down to multiples of the given steps
    pub fn aligned_down_to(&self, h_align: u32, v_align: u32) -> Size {
        Size {
            width: self.width / h_align.max(1) * h_align.max(1),
            height: self.height / v_align.max(1) * v_align.max(1),
        }
    }

    /// Clamp both dimensions into `[min, max]`
    pub fn clamped(&self, min: Size, max: Size) -> Size {
        Size {
            width: self.width.clamp(min.width, max.width),
            height: self.height.clamp(min.height, max.height),
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Inclusive range of sizes with step constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub min: Size,
    pub max: Size,
    pub h_step: u32,
    pub v_step: u32,
}

impl SizeRange {
    pub fn contains(&self, size: Size) -> bool {
        size.width >= self.min.width
            && size.width <= self.max.width
            && size.height >= self.min.height
            && size.height <= self.max.height
            && (self.h_step == 0 || size.width % self.h_step == 0)
            && (self.v_step == 0 || size.height % self.v_step == 0)
    }
}

// ===== Pixel formats =====

/// FourCC pixel format code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelFormat(u32);

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

impl PixelFormat {
    pub const BGR888: PixelFormat = PixelFormat(fourcc(b"BG24"));
    pub const RGB888: PixelFormat = PixelFormat(fourcc(b"RG24"));
    pub const NV12: PixelFormat = PixelFormat(fourcc(b"NV12"));
    pub const YUYV: PixelFormat = PixelFormat(fourcc(b"YUYV"));
    /// ISP parameter metadata
    pub const ISP_PARAMS: PixelFormat = PixelFormat(fourcc(b"RK1P"));
    /// ISP statistics metadata
    pub const ISP_STATS: PixelFormat = PixelFormat(fourcc(b"RK1S"));

    pub const fn from_fourcc(code: u32) -> Self {
        PixelFormat(code)
    }

    pub fn fourcc(&self) -> u32 {
        self.0
    }

    /// Bytes per line and total frame size for a given size
    pub fn frame_layout(&self, size: Size) -> (u32, u32) {
        match *self {
            PixelFormat::BGR888 | PixelFormat::RGB888 => {
                let stride = size.width * 3;
                (stride, stride * size.height)
            }
            PixelFormat::YUYV => {
                let stride = size.width * 2;
                (stride, stride * size.height)
            }
            PixelFormat::NV12 => {
                let stride = size.width;
                (stride, stride * size.height * 3 / 2)
            }
            _ => (0, 0),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.len() != 4 {
            return None;
        }
        Some(PixelFormat(fourcc(&[bytes[0], bytes[1], bytes[2], bytes[3]])))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PixelFormat::BGR888 => return write!(f, "BGR888"),
            PixelFormat::RGB888 => return write!(f, "RGB888"),
            _ => {}
        }
        let bytes = self.0.to_le_bytes();
        for b in bytes {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelFormat({})", self)
    }
}

// ===== Streams =====

/// Intended use of a stream, guiding default configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    Raw,
    StillCapture,
    VideoRecording,
    Viewfinder,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamRole::Raw => "raw",
            StreamRole::StillCapture => "still",
            StreamRole::VideoRecording => "video",
            StreamRole::Viewfinder => "viewfinder",
        };
        write!(f, "{}", name)
    }
}

/// Formats and size ranges a stream can produce
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFormats {
    formats: BTreeMap<PixelFormat, SizeRange>,
}

impl StreamFormats {
    pub fn new(formats: impl IntoIterator<Item = (PixelFormat, SizeRange)>) -> Self {
        Self {
            formats: formats.into_iter().collect(),
        }
    }

    pub fn pixel_formats(&self) -> Vec<PixelFormat> {
        self.formats.keys().copied().collect()
    }

    pub fn range(&self, format: PixelFormat) -> Option<SizeRange> {
        self.formats.get(&format).copied()
    }
}

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);

/// Stream identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

struct StreamInner {
    id: StreamId,
    name: String,
    configuration: RefCell<Option<StreamConfiguration>>,
}

/// Handle to one data path of a camera
#[derive(Clone)]
pub struct Stream {
    inner: Rc<StreamInner>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(StreamInner {
                id: StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)),
                name: name.into(),
                configuration: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration accepted by the last successful configure
    pub fn configuration(&self) -> Option<StreamConfiguration> {
        self.inner.configuration.borrow().clone()
    }

    pub(crate) fn set_configuration(&self, config: Option<StreamConfiguration>) {
        // The stored copy must not point back at its own stream
        *self.inner.configuration.borrow_mut() = config.map(|mut c| {
            c.stream = None;
            c
        });
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({}, {})", self.inner.id, self.inner.name)
    }
}

/// Requested or accepted configuration of one stream
#[derive(Clone, PartialEq)]
pub struct StreamConfiguration {
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub stride: u32,
    pub frame_size: u32,
    pub buffer_count: u32,
    pub formats: StreamFormats,
    stream: Option<Stream>,
}

impl StreamConfiguration {
    pub fn new(pixel_format: PixelFormat, size: Size, buffer_count: u32) -> Self {
        let (stride, frame_size) = pixel_format.frame_layout(size);
        Self {
            pixel_format,
            size,
            stride,
            frame_size,
            buffer_count,
            formats: StreamFormats::default(),
            stream: None,
        }
    }

    pub fn with_formats(mut self, formats: StreamFormats) -> Self {
        self.formats = formats;
        self
    }

    /// Stream bound by the backend during configure
    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    pub fn set_stream(&mut self, stream: Stream) {
        self.stream = Some(stream);
    }

    pub fn update_layout(&mut self) {
        let (stride, frame_size) = self.pixel_format.frame_layout(self.size);
        self.stride = stride;
        self.frame_size = frame_size;
    }
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.size, self.pixel_format)
    }
}

impl fmt::Debug for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfiguration")
            .field("format", &self.pixel_format)
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("frame_size", &self.frame_size)
            .field("buffer_count", &self.buffer_count)
            .field("stream", &self.stream)
            .finish()
    }
}

// ===== Camera configuration =====

/// Global image transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    Identity,
    HFlip,
    VFlip,
    Rot180,
}

/// Result of validating a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Valid,
    Adjusted,
    Invalid,
}

/// Backend-specific configuration validation
pub trait ConfigValidator {
    /// Adjust `config` in place to something the hardware supports
    fn validate(&self, config: &mut CameraConfiguration) -> ConfigStatus;
}

/// Ordered set of stream configurations plus global settings
#[derive(Clone, Default)]
pub struct CameraConfiguration {
    entries: Vec<StreamConfiguration>,
    pub transform: Transform,
    validator: Option<Rc<dyn ConfigValidator>>,
}

impl CameraConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(validator: Rc<dyn ConfigValidator>) -> Self {
        Self {
            entries: Vec::new(),
            transform: Transform::Identity,
            validator: Some(validator),
        }
    }

    pub fn add(&mut self, config: StreamConfiguration) {
        self.entries.push(config);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StreamConfiguration> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut StreamConfiguration> {
        self.entries.get_mut(index)
    }

    pub fn entries(&self) -> &[StreamConfiguration] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<StreamConfiguration> {
        &mut self.entries
    }

    /// Validate and adjust the configuration using the backend's rules
    pub fn validate(&mut self) -> ConfigStatus {
        if self.entries.is_empty() {
            return ConfigStatus::Invalid;
        }
        match self.validator.clone() {
            Some(validator) => validator.validate(self),
            None => ConfigStatus::Valid,
        }
    }
}

impl fmt::Debug for CameraConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraConfiguration")
            .field("entries", &self.entries)
            .field("transform", &self.transform)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_alignment() {
        assert_eq!(Size::new(1925, 1081).aligned_down_to(6, 6), Size::new(1920, 1080));
        assert_eq!(
            Size::new(10, 9000).clamped(Size::new(48, 48), Size::new(4096, 2160)),
            Size::new(48, 2160)
        );
    }

    #[test]
    fn test_frame_layout() {
        let cfg = StreamConfiguration::new(PixelFormat::BGR888, Size::new(1920, 1080), 4);
        assert_eq!(cfg.stride, 5760);
        assert_eq!(cfg.frame_size, 5760 * 1080);

        let (stride, size) = PixelFormat::NV12.frame_layout(Size::new(640, 480));
        assert_eq!((stride, size), (640, 640 * 480 * 3 / 2));
    }

    #[test]
    fn test_pixel_format_display() {
        assert_eq!(PixelFormat::BGR888.to_string(), "BGR888");
        assert_eq!(PixelFormat::NV12.to_string(), "NV12");
        assert_eq!(PixelFormat::parse("NV12"), Some(PixelFormat::NV12));
        assert_eq!(PixelFormat::parse("NV1"), None);
    }

    #[test]
    fn test_empty_configuration_is_invalid() {
        let mut config = CameraConfiguration::new();
        assert_eq!(config.validate(), ConfigStatus::Invalid);
        config.add(StreamConfiguration::new(PixelFormat::NV12, Size::new(64, 64), 2));
        assert_eq!(config.validate(), ConfigStatus::Valid);
    }

    #[test]
    fn test_streams_have_distinct_identity() {
        let a = Stream::new("a");
        let b = Stream::new("a");
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
