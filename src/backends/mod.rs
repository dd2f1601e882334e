// SPDX-License-Identifier: GPL-3.0-only

//! Hardware-family pipeline backends
//!
//! Each backend knows how to drive one family of media devices. The
//! [`CameraManager`](crate::core::CameraManager) instantiates every
//! registered backend and lets it claim devices until nothing matches.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              PipelineHandler                │
//! │   request FIFO · locking · completion order │
//! └────────────────────┬────────────────────────┘
//!                      │ PipelineBackend
//! ┌────────────────────┴────────────────────────┐
//! │  ┌─────────────┐    ┌──────────────────┐    │
//! │  │   Virtual   │    │       ISP        │    │
//! │  │  (vimc)     │    │ (rkisp1 + IPA)   │    │
//! │  └─────────────┘    └──────────────────┘    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`virtual_cam`]: single-stream virtual test pipeline
//! - [`isp`]: ISP pipeline with parameter/statistics buffers and auto exposure

pub mod isp;
pub mod virtual_cam;

use crate::config::Config;
use crate::core::controls::ControlValue;
use crate::core::stream::Size;
use crate::pipeline::PipelineBackend;

pub use isp::IspBackend;
pub use virtual_cam::VirtualBackend;

/// Creates fresh backend instances
pub struct BackendFactory {
    pub name: &'static str,
    pub create: fn(&Config) -> Box<dyn PipelineBackend>,
}

fn create_virtual(_: &Config) -> Box<dyn PipelineBackend> {
    Box::new(VirtualBackend::new())
}

fn create_isp(config: &Config) -> Box<dyn PipelineBackend> {
    Box::new(IspBackend::new(config))
}

static REGISTRY: [BackendFactory; 2] = [
    BackendFactory {
        name: virtual_cam::NAME,
        create: create_virtual,
    },
    BackendFactory {
        name: isp::NAME,
        create: create_isp,
    },
];

/// Every backend compiled into the library, in matching order
pub fn registry() -> &'static [BackendFactory] {
    &REGISTRY
}

pub fn find(name: &str) -> Option<&'static BackendFactory> {
    REGISTRY.iter().find(|f| f.name == name)
}

/// Encode a size property as little-endian width and height words
pub(crate) fn size_property(size: Size) -> ControlValue {
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&size.width.to_le_bytes());
    bytes.extend_from_slice(&size.height.to_le_bytes());
    ControlValue::Bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_are_unique() {
        let names: Vec<_> = registry().iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["vimc", "rkisp1"]);
        assert!(find("rkisp1").is_some());
        assert!(find("uvc").is_none());
    }

    #[test]
    fn test_size_property_layout() {
        let value = size_property(Size::new(640, 480));
        assert_eq!(value.as_bytes(), Some(&[128, 2, 0, 0, 224, 1, 0, 0][..]));
    }
}
