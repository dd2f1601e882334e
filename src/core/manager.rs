// SPDX-License-Identifier: GPL-3.0-only

//! Camera enumeration and hotplug
//!
//! The manager owns the event loop, the device enumerator and one pipeline
//! handler per claimed media device. Starting it runs every enabled backend
//! against the known devices until nothing more matches.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, info, warn};

use super::camera::{Camera, CameraState};
use super::device::{DeviceEnumerator, MediaDevice};
use crate::backends;
use crate::config::Config;
use crate::constants::app_info;
use crate::errors::{HalError, HalResult};
use crate::event_loop::EventLoop;
use crate::pipeline::PipelineHandler;
use crate::signal::Signal;
use crate::sim;

/// Entry point of the camera stack
pub struct CameraManager {
    config: Config,
    event_loop: EventLoop,
    enumerator: DeviceEnumerator,
    handlers: RefCell<Vec<Rc<PipelineHandler>>>,
    cameras: RefCell<Vec<Camera>>,
    camera_added: Signal<Camera>,
    camera_removed: Signal<Camera>,
    started: Cell<bool>,
}

impl CameraManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            event_loop: EventLoop::new(),
            enumerator: DeviceEnumerator::new(),
            handlers: RefCell::new(Vec::new()),
            cameras: RefCell::new(Vec::new()),
            camera_added: Signal::new(),
            camera_removed: Signal::new(),
            started: Cell::new(false),
        }
    }

    /// Library version
    pub fn version() -> &'static str {
        app_info::version()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loop every camera callback runs on
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn enumerator(&self) -> &DeviceEnumerator {
        &self.enumerator
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Add the configured simulated devices and match every backend
    pub fn start(&self) -> HalResult<()> {
        if self.started.get() {
            return Err(HalError::State("camera manager already started".into()));
        }

        for device in &self.config.simulated_devices {
            debug!(kind = ?device.kind, model = %device.model, "Adding simulated device");
            self.enumerator
                .add_device(sim::build(&self.event_loop, device));
        }

        self.started.set(true);
        self.match_devices();
        info!(
            version = Self::version(),
            cameras = self.cameras.borrow().len(),
            "Camera manager started"
        );
        Ok(())
    }

    /// Plug in a media device; matched right away once started
    pub fn add_device(&self, device: MediaDevice) -> Rc<MediaDevice> {
        let device = self.enumerator.add_device(device);
        if self.started.get() {
            self.match_devices();
        }
        device
    }

    fn match_devices(&self) {
        for factory in backends::registry() {
            if !self.config.pipeline_enabled(factory.name) {
                debug!(pipeline = factory.name, "Pipeline disabled");
                continue;
            }

            // One handler instance per matched device
            loop {
                let handler = PipelineHandler::new((factory.create)(&self.config), &self.event_loop);
                let found = handler.match_devices(&self.enumerator, &self.config);
                if found.is_empty() {
                    break;
                }

                self.handlers.borrow_mut().push(handler);
                for camera in found {
                    info!(camera = %camera.id(), pipeline = factory.name, "Camera added");
                    self.cameras.borrow_mut().push(camera.clone());
                    self.camera_added.emit(&camera);
                }
            }
        }
    }

    pub fn cameras(&self) -> Vec<Camera> {
        self.cameras.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Camera> {
        self.cameras.borrow().iter().find(|c| c.id() == id).cloned()
    }

    pub fn camera_added(&self) -> &Signal<Camera> {
        &self.camera_added
    }

    pub fn camera_removed(&self) -> &Signal<Camera> {
        &self.camera_removed
    }

    /// Unplug a media device by model name
    pub fn remove_device(&self, model: &str) -> bool {
        match self.enumerator.remove_device(model) {
            Some(device) => {
                self.handle_device_removed(&device);
                true
            }
            None => false,
        }
    }

    /// Disconnect the pipeline that owns `device` and drop its cameras
    pub fn handle_device_removed(&self, device: &Rc<MediaDevice>) {
        let owners: Vec<Rc<PipelineHandler>> = self
            .handlers
            .borrow()
            .iter()
            .filter(|h| h.owns_device(device))
            .cloned()
            .collect();
        if owners.is_empty() {
            debug!(model = %device.model(), "Removed device was not in use");
            return;
        }

        for handler in owners {
            handler.disconnect();

            let removed: Vec<Camera> = {
                let mut cameras = self.cameras.borrow_mut();
                let (gone, kept) = cameras
                    .drain(..)
                    .partition(|c| Rc::ptr_eq(c.pipe(), &handler));
                *cameras = kept;
                gone
            };
            self.handlers
                .borrow_mut()
                .retain(|h| !Rc::ptr_eq(h, &handler));

            for camera in removed {
                info!(camera = %camera.id(), "Camera removed");
                self.camera_removed.emit(&camera);
            }
        }
    }

    /// Stop and release every camera, then forget them
    pub fn stop(&self) {
        if !self.started.replace(false) {
            return;
        }

        let cameras: Vec<Camera> = self.cameras.borrow_mut().drain(..).collect();
        for camera in &cameras {
            if camera.state() == CameraState::Disconnected {
                continue;
            }
            if let Err(err) = camera.stop().and_then(|_| camera.release()) {
                warn!(camera = %camera.id(), %err, "Failed to shut camera down");
            }
        }
        self.handlers.borrow_mut().clear();
        info!(cameras = cameras.len(), "Camera manager stopped");
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDeviceConfig, SimKind};

    fn vimc_only() -> Config {
        Config {
            simulated_devices: vec![
                SimDeviceConfig::new(SimKind::Vimc, "vimc.0"),
                SimDeviceConfig::new(SimKind::Vimc, "vimc.1"),
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_start_creates_one_camera_per_device() {
        let manager = CameraManager::new(vimc_only());
        manager.start().unwrap();
        let ids: Vec<String> = manager.cameras().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["vimc.0:Sensor B", "vimc.1:Sensor B"]);
        assert!(manager.get("vimc.1:Sensor B").is_some());
        assert!(manager.start().unwrap_err().is_state());
    }

    #[test]
    fn test_disabled_pipeline_matches_nothing() {
        let config = Config {
            pipelines: vec!["rkisp1".into()],
            ..vimc_only()
        };
        let manager = CameraManager::new(config);
        manager.start().unwrap();
        assert!(manager.cameras().is_empty());
    }
}
