// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture lifecycle on the virtual pipeline

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use camera_hal::core::controls::{ControlValue, ids};
use camera_hal::core::FrameStatus;
use camera_hal::sim::CompletionMode;
use camera_hal::v4l2::VideoNode;
use camera_hal::v4l2::ioctl::V4L2_CID_BRIGHTNESS;
use camera_hal::{CameraState, ControlList, HalError, RequestStatus, ReuseFlag, Size};
use common::*;

#[test]
fn test_four_requests_complete_in_order() {
    let rig = vimc_rig(CompletionMode::Auto);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, Some(Size::new(1920, 1080)));
    let requests = requests(camera, &stream, &allocator);
    assert_eq!(requests.len(), 4);

    let (completed, _sub) = record(camera);
    camera.start(None).unwrap();
    assert_eq!(camera.state(), CameraState::Running);
    for request in &requests {
        camera.queue_request(request).unwrap();
    }
    assert_eq!(camera.queued_requests(), 4);

    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == 4));

    let completed = completed.borrow();
    assert_eq!(cookies(&completed), vec![0, 1, 2, 3]);
    let sequences: Vec<u32> = completed.iter().map(|r| r.sequence()).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    for request in completed.iter() {
        assert_eq!(request.status(), RequestStatus::Complete);
        assert!(request.metadata().contains(ids::SENSOR_TIMESTAMP));
    }
    assert_eq!(camera.next_sequence(), 4);
    assert_eq!(camera.queued_requests(), 0);

    camera.stop().unwrap();
    assert_eq!(camera.state(), CameraState::Configured);
    camera.release().unwrap();
    assert_eq!(camera.state(), CameraState::Available);
}

#[test]
fn test_out_of_order_hardware_completion_is_reordered() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let (completed, _sub) = record(camera);
    camera.start(None).unwrap();
    for request in requests.iter().take(3) {
        camera.queue_request(request).unwrap();
    }

    // Second, then third, then first
    assert!(rig.capture.complete_at(1, FrameStatus::Success));
    assert!(rig.capture.complete_at(1, FrameStatus::Success));
    rig.event_loop.dispatch_pending();
    assert!(completed.borrow().is_empty());
    assert_eq!(requests[1].status(), RequestStatus::Queued);

    assert!(rig.capture.complete_next(FrameStatus::Success));
    rig.event_loop.dispatch_pending();
    assert_eq!(cookies(&completed.borrow()), vec![0, 1, 2]);
    camera.stop().unwrap();
}

#[test]
fn test_buffer_completed_precedes_request_completed() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let order = Rc::new(RefCell::new(Vec::new()));
    let _buffers = {
        let order = order.clone();
        camera
            .buffer_completed()
            .connect(move |(request, _)| order.borrow_mut().push(format!("buffer {}", request.cookie())))
    };
    let _requests = {
        let order = order.clone();
        camera
            .request_completed()
            .connect(move |request| order.borrow_mut().push(format!("request {}", request.cookie())))
    };

    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    rig.capture.complete_next(FrameStatus::Success);
    rig.event_loop.dispatch_pending();

    assert_eq!(*order.borrow(), vec!["buffer 0", "request 0"]);
    camera.stop().unwrap();
}

#[test]
fn test_stop_cancels_queued_requests_in_order() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let (completed, _sub) = record(camera);
    camera.start(None).unwrap();
    for request in &requests {
        camera.queue_request(request).unwrap();
    }
    rig.capture.complete_next(FrameStatus::Success);
    rig.event_loop.dispatch_pending();
    assert_eq!(completed.borrow().len(), 1);

    camera.stop().unwrap();

    // Everything finished before stop returned
    assert_eq!(cookies(&completed.borrow()), vec![0, 1, 2, 3]);
    let statuses: Vec<RequestStatus> = completed.borrow().iter().map(|r| r.status()).collect();
    assert_eq!(
        statuses,
        vec![
            RequestStatus::Complete,
            RequestStatus::Cancelled,
            RequestStatus::Cancelled,
            RequestStatus::Cancelled
        ]
    );
    for request in &requests[1..] {
        for (_, buffer) in request.buffers() {
            assert_eq!(buffer.metadata().status, FrameStatus::Cancelled);
        }
    }
    assert_eq!(camera.queued_requests(), 0);

    // Stale completions from the stopped session are dropped
    rig.event_loop.dispatch_pending();
    assert_eq!(completed.borrow().len(), 4);
}

#[test]
fn test_requests_can_be_reused_after_completion() {
    let rig = vimc_rig(CompletionMode::Auto);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let (completed, _sub) = record(camera);
    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == 1));

    // A completed request cannot be queued again as is
    let err = camera.queue_request(&requests[0]).unwrap_err();
    assert!(matches!(err, HalError::InvalidRequest(_)));

    requests[0].reuse(ReuseFlag::ReuseBuffers).unwrap();
    assert_eq!(requests[0].status(), RequestStatus::Pending);
    assert_eq!(requests[0].buffer_count(), 1);
    camera.queue_request(&requests[0]).unwrap();
    assert!(rig.event_loop.run_until(WAIT, || completed.borrow().len() == 2));
    assert_eq!(completed.borrow()[1].sequence(), 1);

    camera.stop().unwrap();
}

#[test]
fn test_operations_rejected_in_wrong_state() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;

    let mut config = camera
        .generate_configuration(&[camera_hal::StreamRole::Viewfinder])
        .unwrap();
    assert!(camera.configure(&mut config).unwrap_err().is_state());
    assert!(camera.start(None).unwrap_err().is_state());
    assert!(camera.create_request(0).unwrap_err().is_state());
    assert_eq!(camera.state(), CameraState::Available);

    // Rejected calls never reach the hardware
    assert!(rig.capture.format().is_none());
    assert_eq!(rig.sensor.write_count(), 0);
    assert!(!rig.capture.is_streaming());

    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    // Configured but not running
    assert!(camera.queue_request(&requests[0]).unwrap_err().is_state());
    assert_eq!(rig.capture.queued_count(), 0);

    // A second acquire is a resource conflict
    assert!(matches!(camera.acquire(), Err(HalError::Resource(_))));

    camera.start(None).unwrap();
    assert!(camera.start(None).unwrap_err().is_state());
    assert!(camera.release().unwrap_err().is_state());
    camera.stop().unwrap();
    camera.stop().unwrap();
}

#[test]
fn test_synchronous_queue_failure_cancels_only_that_request() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let (completed, _sub) = record(camera);
    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    rig.capture.fail_next_queue(libc::EIO);
    camera.queue_request(&requests[1]).unwrap();
    camera.queue_request(&requests[2]).unwrap();

    // The failed request waits behind the first one
    assert!(completed.borrow().is_empty());
    assert_eq!(requests[1].status(), RequestStatus::Queued);

    rig.capture.complete_next(FrameStatus::Success);
    rig.capture.complete_next(FrameStatus::Success);
    rig.event_loop.dispatch_pending();

    let completed = completed.borrow();
    assert_eq!(cookies(&completed), vec![0, 1, 2]);
    assert_eq!(completed[0].status(), RequestStatus::Complete);
    assert_eq!(completed[1].status(), RequestStatus::Cancelled);
    assert_eq!(completed[1].error().and_then(|e| e.errno()), Some(-libc::EIO));
    assert_eq!(completed[2].status(), RequestStatus::Complete);
    drop(completed);
    camera.stop().unwrap();
}

#[test]
fn test_request_controls_reach_the_sensor() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    assert!(camera.controls().contains(ids::BRIGHTNESS));

    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let mut initial = ControlList::new();
    initial.set(ids::BRIGHTNESS, ControlValue::Float(-1.0));
    camera.start(Some(&initial)).unwrap();
    assert_eq!(rig.sensor.value(V4L2_CID_BRIGHTNESS), Some(0));

    requests[0]
        .controls_mut()
        .set(ids::BRIGHTNESS, ControlValue::Float(0.5));
    camera.queue_request(&requests[0]).unwrap();
    assert_eq!(rig.sensor.value(V4L2_CID_BRIGHTNESS), Some(192));
    camera.stop().unwrap();
}

#[test]
fn test_disconnect_cancels_and_fails_later_calls() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, allocator) = configure(camera, None);
    let requests = requests(camera, &stream, &allocator);

    let (completed, _sub) = record(camera);
    let disconnected = Rc::new(RefCell::new(Vec::new()));
    let _disc = {
        let disconnected = disconnected.clone();
        camera
            .disconnected()
            .connect(move |id: &String| disconnected.borrow_mut().push(id.clone()))
    };

    camera.start(None).unwrap();
    camera.queue_request(&requests[0]).unwrap();
    camera.queue_request(&requests[1]).unwrap();

    let media = rig.enumerator.remove_device("vimc.0").unwrap();
    assert!(rig.handler.owns_device(&media));
    rig.handler.disconnect();

    assert!(rig.handler.is_disconnected());
    assert_eq!(camera.state(), CameraState::Disconnected);
    assert_eq!(*disconnected.borrow(), vec!["vimc.0:Sensor B".to_string()]);
    assert_eq!(cookies(&completed.borrow()), vec![0, 1]);
    assert!(completed
        .borrow()
        .iter()
        .all(|r| r.status() == RequestStatus::Cancelled));
    assert!(!rig.capture.is_streaming());

    // Late hardware completions are ignored
    rig.capture.complete_next(FrameStatus::Success);
    rig.event_loop.dispatch_pending();
    assert_eq!(completed.borrow().len(), 2);

    // The handle stays valid but every operation fails
    assert!(matches!(camera.stop(), Err(HalError::Disconnected(_))));
    assert!(matches!(camera.release(), Err(HalError::Disconnected(_))));
    assert!(matches!(
        camera.queue_request(&requests[2]),
        Err(HalError::Disconnected(_))
    ));
    assert!(matches!(camera.create_request(9), Err(HalError::Disconnected(_))));
}

#[test]
fn test_allocator_follows_camera_state() {
    let rig = vimc_rig(CompletionMode::Manual);
    let camera = &rig.camera;
    let (stream, mut allocator) = configure(camera, None);
    assert!(allocator.allocated());
    assert_eq!(allocator.buffers(&stream).len(), 4);
    assert!(matches!(allocator.allocate(&stream), Err(HalError::Resource(_))));

    camera.start(None).unwrap();
    assert!(allocator.free(&stream).unwrap_err().is_state());
    camera.stop().unwrap();

    allocator.free(&stream).unwrap();
    assert!(!allocator.allocated());
    assert!(matches!(allocator.free(&stream), Err(HalError::NotFound(_))));
    assert_eq!(allocator.allocate(&stream).unwrap(), 4);
}

#[test]
fn test_acquire_fails_while_device_is_held_elsewhere() {
    let rig = vimc_rig(CompletionMode::Auto);
    let camera = &rig.camera;
    let media = rig.enumerator.devices()[0].clone();

    assert!(media.lock());
    assert!(matches!(camera.acquire(), Err(HalError::Resource(_))));
    assert_eq!(camera.state(), CameraState::Available);

    media.unlock();
    camera.acquire().unwrap();
    assert_eq!(camera.state(), CameraState::Acquired);
    assert!(media.is_locked());

    camera.release().unwrap();
    assert!(!media.is_locked());
}
