// SPDX-License-Identifier: GPL-3.0-only

//! Media devices and device enumeration
//!
//! A [`MediaDevice`] groups the entities of one piece of imaging hardware
//! (sensor, ISP, DMA engines). Backends claim devices through the
//! [`DeviceEnumerator`] with a [`DeviceMatch`]; a claimed device is never
//! handed out twice.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info};

use crate::errors::{HalError, HalResult};
use crate::v4l2::{ControlIo, VideoNode};

/// Role of an entity in the media graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityFunction {
    Sensor,
    Isp,
    Scaler,
    VideoCapture,
    VideoOutput,
}

/// Kernel interface of an entity
#[derive(Clone)]
pub enum EntityNode {
    /// Buffer queue interface
    Video(Rc<dyn VideoNode>),
    /// Control and event interface
    Subdev(Rc<dyn ControlIo>),
    None,
}

/// One entity of a media device
#[derive(Clone)]
pub struct MediaEntity {
    pub name: String,
    pub function: EntityFunction,
    pub node: EntityNode,
}

impl fmt::Debug for MediaEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = match self.node {
            EntityNode::Video(_) => "video",
            EntityNode::Subdev(_) => "subdev",
            EntityNode::None => "none",
        };
        f.debug_struct("MediaEntity")
            .field("name", &self.name)
            .field("function", &self.function)
            .field("node", &node)
            .finish()
    }
}

/// A media device and its entities
pub struct MediaDevice {
    driver: String,
    model: String,
    entities: Vec<MediaEntity>,
    acquired: Cell<bool>,
    locked: Cell<bool>,
    removed: Cell<bool>,
}

impl MediaDevice {
    pub fn new(driver: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            model: model.into(),
            entities: Vec::new(),
            acquired: Cell::new(false),
            locked: Cell::new(false),
            removed: Cell::new(false),
        }
    }

    pub fn add_entity(&mut self, name: impl Into<String>, function: EntityFunction, node: EntityNode) {
        self.entities.push(MediaEntity {
            name: name.into(),
            function,
            node,
        });
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn entities(&self) -> &[MediaEntity] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&MediaEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// First entity with the given function
    pub fn entity_by_function(&self, function: EntityFunction) -> Option<&MediaEntity> {
        self.entities.iter().find(|e| e.function == function)
    }

    pub fn video_node(&self, name: &str) -> HalResult<Rc<dyn VideoNode>> {
        match self.entity(name).map(|e| &e.node) {
            Some(EntityNode::Video(node)) => Ok(node.clone()),
            Some(_) => Err(HalError::Configuration(format!(
                "{}: entity {} has no video node",
                self.model, name
            ))),
            None => Err(HalError::NotFound(format!("{}: entity {}", self.model, name))),
        }
    }

    pub fn subdev(&self, name: &str) -> HalResult<Rc<dyn ControlIo>> {
        match self.entity(name).map(|e| &e.node) {
            Some(EntityNode::Subdev(io)) => Ok(io.clone()),
            Some(_) => Err(HalError::Configuration(format!(
                "{}: entity {} has no subdevice node",
                self.model, name
            ))),
            None => Err(HalError::NotFound(format!("{}: entity {}", self.model, name))),
        }
    }

    /// Take the exclusive hardware lock
    pub fn lock(&self) -> bool {
        if self.locked.get() || self.removed.get() {
            return false;
        }
        self.locked.set(true);
        true
    }

    pub fn unlock(&self) {
        self.locked.set(false);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.get()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }
}

impl fmt::Debug for MediaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDevice")
            .field("driver", &self.driver)
            .field("model", &self.model)
            .field("entities", &self.entities)
            .field("acquired", &self.acquired.get())
            .finish()
    }
}

/// Criteria a backend uses to claim a media device
#[derive(Debug, Clone)]
pub struct DeviceMatch {
    driver: String,
    entities: Vec<String>,
}

impl DeviceMatch {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            entities: Vec::new(),
        }
    }

    /// Require an entity with this name
    pub fn entity(mut self, name: impl Into<String>) -> Self {
        self.entities.push(name.into());
        self
    }

    pub fn matches(&self, device: &MediaDevice) -> bool {
        device.driver == self.driver
            && self
                .entities
                .iter()
                .all(|name| device.entity(name).is_some())
    }
}

/// Registry of media devices present in the system
#[derive(Default)]
pub struct DeviceEnumerator {
    devices: RefCell<Vec<Rc<MediaDevice>>>,
}

impl DeviceEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: MediaDevice) -> Rc<MediaDevice> {
        info!(driver = %device.driver, model = %device.model, "Media device added");
        let device = Rc::new(device);
        self.devices.borrow_mut().push(device.clone());
        device
    }

    /// Claim the first unclaimed device matching `dm`
    pub fn search(&self, dm: &DeviceMatch) -> Option<Rc<MediaDevice>> {
        let devices = self.devices.borrow();
        let device = devices
            .iter()
            .find(|d| !d.acquired.get() && !d.removed.get() && dm.matches(d))?;
        device.acquired.set(true);
        debug!(driver = %device.driver, model = %device.model, "Media device claimed");
        Some(device.clone())
    }

    /// Remove a device on hot-unplug
    pub fn remove_device(&self, model: &str) -> Option<Rc<MediaDevice>> {
        let mut devices = self.devices.borrow_mut();
        let index = devices.iter().position(|d| d.model == model)?;
        let device = devices.remove(index);
        device.removed.set(true);
        device.locked.set(false);
        info!(driver = %device.driver, model = %device.model, "Media device removed");
        Some(device)
    }

    pub fn devices(&self) -> Vec<Rc<MediaDevice>> {
        self.devices.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(driver: &str, model: &str) -> MediaDevice {
        let mut dev = MediaDevice::new(driver, model);
        dev.add_entity("sensor", EntityFunction::Sensor, EntityNode::None);
        dev.add_entity("capture", EntityFunction::VideoCapture, EntityNode::None);
        dev
    }

    #[test]
    fn test_search_claims_once() {
        let enumerator = DeviceEnumerator::new();
        enumerator.add_device(device("vimc", "a"));
        enumerator.add_device(device("vimc", "b"));

        let dm = DeviceMatch::new("vimc").entity("sensor");
        assert_eq!(enumerator.search(&dm).unwrap().model(), "a");
        assert_eq!(enumerator.search(&dm).unwrap().model(), "b");
        assert!(enumerator.search(&dm).is_none());
    }

    #[test]
    fn test_match_requires_all_entities() {
        let dm = DeviceMatch::new("vimc").entity("sensor").entity("scaler");
        assert!(!dm.matches(&device("vimc", "a")));
        assert!(!DeviceMatch::new("uvc").matches(&device("vimc", "a")));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dev = device("vimc", "a");
        assert!(dev.lock());
        assert!(!dev.lock());
        dev.unlock();
        assert!(dev.lock());
    }

    #[test]
    fn test_removed_device_cannot_lock() {
        let enumerator = DeviceEnumerator::new();
        let dev = enumerator.add_device(device("vimc", "a"));
        enumerator.remove_device("a");
        assert!(dev.is_removed());
        assert!(!dev.lock());
        assert!(dev.video_node("capture").is_err());
    }
}
