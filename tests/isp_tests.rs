// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the ISP pipeline and its auto exposure loop

mod common;

use camera_hal::core::controls::ids;
use camera_hal::core::FrameStatus;
use camera_hal::ipa::IpaNotification;
use camera_hal::pipeline::DeviceEvent;
use camera_hal::sim::CompletionMode;
use camera_hal::v4l2::ioctl::{V4L2_CID_ANALOGUE_GAIN, V4L2_CID_EXPOSURE};
use camera_hal::v4l2::VideoNode;
use camera_hal::{Config, ControlList, ControlValue, HalError, RequestStatus};
use common::*;

#[test]
fn test_on_target_scene_reports_locked_exposure() {
    let rig = isp_rig(&Config::default(), 60);
    let camera = rig.camera.as_ref().unwrap();
    assert_eq!(camera.id(), "rkisp1.0:rkisp1.0 sensor");

    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    camera.start(None).unwrap();
    for request in &requests {
        camera.queue_request(request).unwrap();
    }
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == requests.len()));

    let completed = completed.borrow();
    assert_eq!(cookies(&completed), vec![0, 1, 2, 3]);
    for request in completed.iter() {
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(
            request.metadata().get(ids::AE_LOCKED),
            Some(&ControlValue::Bool(true))
        );
        assert!(request.metadata().contains(ids::SENSOR_TIMESTAMP));
    }
    drop(completed);
    camera.stop().unwrap();
}

#[test]
fn test_dark_scene_is_not_locked() {
    let rig = isp_rig(&Config::default(), 40);
    let camera = rig.camera.as_ref().unwrap();
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == 1));
    assert_eq!(
        completed.borrow()[0].metadata().get(ids::AE_LOCKED),
        Some(&ControlValue::Bool(false))
    );
    camera.stop().unwrap();
}

#[test]
fn test_start_programs_initial_exposure() {
    let rig = isp_rig(&Config::default(), 60);
    let camera = rig.camera.as_ref().unwrap();
    configure(camera, None);
    assert_eq!(rig.sensor.value(V4L2_CID_EXPOSURE), Some(100));

    camera.start(None).unwrap();
    assert!(rig
        .event_loop
        .run_until(WAIT, || rig.sensor.value(V4L2_CID_EXPOSURE) == Some(1)));
    assert_eq!(rig.sensor.value(V4L2_CID_ANALOGUE_GAIN), Some(16));
    assert!(rig.params.is_streaming());
    assert!(rig.stats.is_streaming());

    camera.stop().unwrap();
    assert!(!rig.mainpath.is_streaming());
}

#[test]
fn test_disabled_auto_exposure_keeps_sensor_exposure() {
    let rig = isp_rig(&Config::default(), 20);
    let camera = rig.camera.as_ref().unwrap();
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    let mut manual = ControlList::new();
    manual.set(ids::AE_ENABLE, false);
    camera.start(Some(&manual)).unwrap();
    for request in &requests {
        request.controls_mut().set(ids::AE_ENABLE, false);
        camera.queue_request(request).unwrap();
    }
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == requests.len()));
    assert!(completed
        .borrow()
        .iter()
        .all(|r| r.status() == RequestStatus::Complete));

    // Only the initial programming from start() reached the sensor
    assert_eq!(rig.sensor.value(V4L2_CID_EXPOSURE), Some(1));
    assert_eq!(rig.sensor.value(V4L2_CID_ANALOGUE_GAIN), Some(16));
    camera.stop().unwrap();
}

#[test]
fn test_unsupported_hardware_revision_yields_no_camera() {
    let mut config = Config::default();
    config.isp.hw_revision = 9;
    let rig = isp_rig(&config, 60);
    assert!(rig.camera.is_none());
    assert!(rig.handler.cameras().is_empty());
}

#[test]
fn test_small_pools_park_requests_in_order() {
    let mut config = Config::default();
    config.isp.param_buffers = 1;
    config.isp.stat_buffers = 1;
    let rig = isp_rig(&config, 60);
    let camera = rig.camera.as_ref().unwrap();
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    camera.start(None).unwrap();
    for request in &requests {
        camera.queue_request(request).unwrap();
    }
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == requests.len()));

    let completed = completed.borrow();
    assert_eq!(cookies(&completed), vec![0, 1, 2, 3]);
    assert!(completed.iter().all(|r| r.status() == RequestStatus::Complete));
    let sequences: Vec<u32> = completed.iter().map(|r| r.sequence()).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    drop(completed);
    camera.stop().unwrap();
}

#[test]
fn test_stop_cancels_frames_waiting_for_output() {
    let rig = isp_rig(&Config::default(), 60);
    rig.mainpath.set_mode(CompletionMode::Manual);
    let camera = rig.camera.as_ref().unwrap();
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    camera.queue_request(&requests[1]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || rig.mainpath.queued_count() == 2));

    camera.stop().unwrap();
    assert_eq!(cookies(&completed.borrow()), vec![0, 1]);
    assert!(completed
        .borrow()
        .iter()
        .all(|r| r.status() == RequestStatus::Cancelled));
    assert_eq!(rig.mainpath.queued_count(), 0);

    // A fresh session starts from a clean tracker
    for request in &requests[..2] {
        request.reuse(camera_hal::ReuseFlag::ReuseBuffers).unwrap();
    }
    rig.mainpath.set_mode(CompletionMode::Auto);
    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == 3));
    assert_eq!(completed.borrow()[2].status(), RequestStatus::Complete);
    camera.stop().unwrap();
}

#[test]
fn test_ipa_failure_cancels_in_flight_and_later_requests() {
    let rig = isp_rig(&Config::default(), 60);
    rig.mainpath.set_mode(CompletionMode::Manual);
    let camera = rig.camera.as_ref().unwrap();
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);
    let (completed, _sub) = record(camera);

    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || rig.mainpath.queued_count() == 1));

    rig.handler
        .handle_event(DeviceEvent::Ipa(IpaNotification::Fatal("algorithm crashed".into())));
    assert_eq!(cookies(&completed.borrow()), vec![0]);
    assert_eq!(completed.borrow()[0].status(), RequestStatus::Cancelled);
    assert!(matches!(completed.borrow()[0].error(), Some(HalError::Protocol(_))));

    // The output buffer may still come back; it no longer belongs to a frame
    rig.mainpath.complete_next(FrameStatus::Success);
    rig.event_loop.dispatch_pending();
    assert_eq!(completed.borrow().len(), 1);

    camera.queue_request(&requests[1]).unwrap();
    assert_eq!(cookies(&completed.borrow()), vec![0, 1]);
    assert_eq!(completed.borrow()[1].status(), RequestStatus::Cancelled);
    assert!(matches!(completed.borrow()[1].error(), Some(HalError::Protocol(_))));

    camera.stop().unwrap();
}
