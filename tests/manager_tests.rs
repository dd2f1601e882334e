// SPDX-License-Identifier: GPL-3.0-only

//! Camera manager enumeration and hotplug

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use camera_hal::sim;
use camera_hal::{CameraManager, CameraState, Config, HalError, RequestStatus};
use common::*;

fn ids(manager: &CameraManager) -> Vec<String> {
    let mut ids: Vec<String> = manager.cameras().iter().map(|c| c.id().to_string()).collect();
    ids.sort();
    ids
}

fn watch(signal: &camera_hal::Signal<camera_hal::Camera>) -> (Rc<RefCell<Vec<String>>>, camera_hal::Subscription) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let sub = signal.connect(move |camera: &camera_hal::Camera| sink.borrow_mut().push(camera.id().to_string()));
    (seen, sub)
}

#[test]
fn test_default_configuration_finds_both_pipelines() {
    let manager = CameraManager::new(Config::default());
    let (added, _sub) = watch(manager.camera_added());
    assert!(!manager.is_started());

    manager.start().unwrap();
    assert!(manager.is_started());
    assert_eq!(ids(&manager), vec!["rkisp1.0:rkisp1.0 sensor", "vimc.0:Sensor B"]);
    assert_eq!(added.borrow().len(), 2);
    assert!(!CameraManager::version().is_empty());

    let camera = manager.get("vimc.0:Sensor B").unwrap();
    assert_eq!(camera.state(), CameraState::Available);
    assert!(manager.get("uvc.0:Nope").is_none());
}

#[test]
fn test_capture_through_the_manager() {
    let manager = CameraManager::new(Config::default());
    manager.start().unwrap();

    let camera = manager.get("vimc.0:Sensor B").unwrap();
    let (stream, allocator) = configure(&camera, None);
    let requests = requests(&camera, &stream, &allocator);
    let (completed, _sub) = record(&camera);

    camera.start(None).unwrap();
    for request in &requests {
        camera.queue_request(request).unwrap();
    }
    assert!(manager
        .event_loop()
        .run_until(WAIT, || completed.borrow().len() == requests.len()));
    assert!(completed
        .borrow()
        .iter()
        .all(|r| r.status() == RequestStatus::Complete));

    // Stopping the manager shuts running cameras down
    manager.stop();
    assert_eq!(camera.state(), CameraState::Available);
    assert!(manager.cameras().is_empty());
}

#[test]
fn test_hot_unplug_disconnects_only_that_camera() {
    let manager = CameraManager::new(Config::default());
    let (removed, _sub) = watch(manager.camera_removed());
    manager.start().unwrap();

    let camera = manager.get("vimc.0:Sensor B").unwrap();
    let (stream, allocator) = configure(&camera, None);
    let requests = requests(&camera, &stream, &allocator);
    let (completed, _done) = record(&camera);
    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();

    assert!(manager.remove_device("vimc.0"));
    assert_eq!(*removed.borrow(), vec!["vimc.0:Sensor B".to_string()]);
    assert_eq!(camera.state(), CameraState::Disconnected);
    assert_eq!(ids(&manager), vec!["rkisp1.0:rkisp1.0 sensor"]);

    // The in-flight request completed as cancelled, at most once
    manager.event_loop().dispatch_pending();
    assert_eq!(completed.borrow().len(), 1);
    assert_eq!(completed.borrow()[0].status(), RequestStatus::Cancelled);
    assert!(matches!(camera.acquire(), Err(HalError::Disconnected(_))));

    // The other camera is untouched
    let isp = manager.get("rkisp1.0:rkisp1.0 sensor").unwrap();
    isp.acquire().unwrap();
    isp.release().unwrap();

    assert!(!manager.remove_device("vimc.0"));
    assert!(!manager.remove_device("uvc.7"));
    assert_eq!(removed.borrow().len(), 1);
}

#[test]
fn test_device_added_after_start_is_matched() {
    let config = Config {
        simulated_devices: Vec::new(),
        ..Config::default()
    };
    let manager = CameraManager::new(config);
    let (added, _sub) = watch(manager.camera_added());
    manager.start().unwrap();
    assert!(manager.cameras().is_empty());

    let sim = sim::vimc_device(manager.event_loop(), "vimc.4");
    manager.add_device(sim.media);
    assert_eq!(*added.borrow(), vec!["vimc.4:Sensor B".to_string()]);
    assert!(manager.get("vimc.4:Sensor B").is_some());
}

#[test]
fn test_device_added_before_start_waits_for_start() {
    let config = Config {
        simulated_devices: Vec::new(),
        ..Config::default()
    };
    let manager = CameraManager::new(config);
    let sim = sim::vimc_device(manager.event_loop(), "vimc.5");
    manager.add_device(sim.media);
    assert!(manager.cameras().is_empty());

    manager.start().unwrap();
    assert_eq!(ids(&manager), vec!["vimc.5:Sensor B"]);
}
