// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for V4L2 controls and frame start events

use std::cell::RefCell;
use std::rc::Rc;

use camera_hal::core::controls::ControlType;
use camera_hal::sim::{SimControl, SimSubdevice};
use camera_hal::v4l2::ioctl::*;
use camera_hal::v4l2::{ControlIo, SetOutcome, V4l2Device};
use camera_hal::{ControlList, ControlValue, EventLoop, HalError};

const LUT: u32 = V4L2_CID_USER_BASE + 0x1000;
const PIXEL_RATE: u32 = V4L2_CID_USER_BASE + 0x1001;
const FLASH: u32 = V4L2_CID_USER_BASE + 0x1002;

fn sensor() -> Rc<SimSubdevice> {
    Rc::new(
        SimSubdevice::new("imx219 1-0010")
            .with_control(SimControl::class(V4L2_CID_USER_CLASS, "User Controls"))
            .with_control(SimControl::integer(V4L2_CID_BRIGHTNESS, "Brightness", 0, 255, 128))
            .with_control(SimControl::integer(V4L2_CID_CONTRAST, "Contrast", 0, 255, 128))
            .with_control(SimControl::integer(V4L2_CID_SATURATION, "Saturation", 0, 255, 128))
            .with_control(SimControl::byte_array(LUT, "Lookup Table", 4))
            .with_control(SimControl::integer64(PIXEL_RATE, "Pixel Rate", 1, 1 << 40, 1 << 30))
            .with_control(SimControl::boolean(FLASH, "Flash", false)),
    )
}

fn open(sensor: &Rc<SimSubdevice>, event_loop: &EventLoop) -> V4l2Device {
    V4l2Device::open(sensor.clone(), event_loop).unwrap()
}

#[test]
fn test_controls_are_enumerated_without_class_markers() {
    let event_loop = EventLoop::new();
    let device = open(&sensor(), &event_loop);

    let map = device.control_info_map();
    assert_eq!(map.len(), 6);
    assert!(!map.contains(V4L2_CID_USER_CLASS));

    let brightness = device.control_info(V4L2_CID_BRIGHTNESS).unwrap();
    assert_eq!(brightness.name, "Brightness");
    assert_eq!(brightness.control_type, ControlType::Int32);
    assert_eq!(brightness.info.def, ControlValue::Int32(128));

    let lut = device.control_info(LUT).unwrap();
    assert!(lut.is_array());
    assert_eq!(lut.payload_len(), 4);
    assert_eq!(device.control_info(PIXEL_RATE).unwrap().control_type, ControlType::Int64);
    assert_eq!(device.control_info(FLASH).unwrap().control_type, ControlType::Bool);
}

#[test]
fn test_read_back_is_stable() {
    let event_loop = EventLoop::new();
    let device = open(&sensor(), &event_loop);
    let ids = [V4L2_CID_BRIGHTNESS, LUT, PIXEL_RATE, FLASH];

    let mut values = device.get_controls(&ids).unwrap();
    assert_eq!(values.get(LUT), Some(&ControlValue::Bytes(vec![0; 4])));
    assert_eq!(values.get(PIXEL_RATE), Some(&ControlValue::Int64(1 << 30)));
    assert_eq!(values.get(FLASH), Some(&ControlValue::Bool(false)));

    let before = values.clone();
    assert_eq!(device.set_controls(&mut values).unwrap(), SetOutcome::Applied);
    assert_eq!(values, before);
    assert_eq!(device.get_controls(&ids).unwrap(), before);
}

#[test]
fn test_write_reports_driver_adjusted_values() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    let mut ctrls = ControlList::new();
    ctrls.set(V4L2_CID_BRIGHTNESS, 300);
    ctrls.set(LUT, vec![1u8, 2, 3, 4]);
    assert_eq!(device.set_controls(&mut ctrls).unwrap(), SetOutcome::Applied);

    assert_eq!(ctrls.get(V4L2_CID_BRIGHTNESS), Some(&ControlValue::Int32(255)));
    assert_eq!(sim.value(V4L2_CID_BRIGHTNESS), Some(255));
    assert_eq!(sim.bytes(LUT), Some(vec![1, 2, 3, 4]));
}

#[test]
fn test_partial_write_applies_only_the_prefix() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    let mut ctrls = ControlList::new();
    ctrls.set(V4L2_CID_BRIGHTNESS, 10);
    ctrls.set(V4L2_CID_CONTRAST, 20);
    ctrls.set(V4L2_CID_SATURATION, 30);
    sim.fail_next_set(1, libc::EINVAL);

    let outcome = device.set_controls(&mut ctrls).unwrap();
    assert_eq!(
        outcome,
        SetOutcome::Partial {
            failed_at: 1,
            errno: -libc::EINVAL
        }
    );
    assert_eq!(sim.value(V4L2_CID_BRIGHTNESS), Some(10));
    assert_eq!(sim.value(V4L2_CID_CONTRAST), Some(128));
    assert_eq!(sim.value(V4L2_CID_SATURATION), Some(128));

    // Entries from the failing index on keep the caller's values
    assert_eq!(ctrls.get(V4L2_CID_CONTRAST), Some(&ControlValue::Int32(20)));
    assert_eq!(ctrls.get(V4L2_CID_SATURATION), Some(&ControlValue::Int32(30)));
}

#[test]
fn test_whole_write_failure_is_an_error() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    let mut ctrls = ControlList::new();
    ctrls.set(V4L2_CID_BRIGHTNESS, 10);
    ctrls.set(V4L2_CID_CONTRAST, 20);
    sim.fail_next_set(0, libc::EBUSY);

    let err = device.set_controls(&mut ctrls).unwrap_err();
    assert_eq!(err.errno(), Some(-libc::EBUSY));
    assert_eq!(sim.value(V4L2_CID_BRIGHTNESS), Some(128));
}

#[test]
fn test_unknown_ids_and_bad_values() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    // Reads of unknown ids yield nothing at all
    let values = device.get_controls(&[V4L2_CID_BRIGHTNESS, V4L2_CID_HUE]).unwrap();
    assert!(values.is_empty());

    let mut ctrls = ControlList::new();
    ctrls.set(V4L2_CID_BRIGHTNESS, 1);
    ctrls.set(V4L2_CID_HUE, 1);
    assert!(matches!(device.set_controls(&mut ctrls), Err(HalError::NotFound(_))));

    let mut ctrls = ControlList::new();
    ctrls.set(LUT, vec![1u8, 2]);
    assert!(matches!(
        device.set_controls(&mut ctrls),
        Err(HalError::InvalidRequest(_))
    ));
    assert_eq!(sim.write_count(), 0);
}

#[test]
fn test_read_failure_is_a_device_error() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    sim.fail_next_get(libc::EIO);
    let err = device.get_controls(&[V4L2_CID_BRIGHTNESS]).unwrap_err();
    assert_eq!(err.errno(), Some(-libc::EIO));
    assert!(device.get_controls(&[V4L2_CID_BRIGHTNESS]).is_ok());
}

#[test]
fn test_read_stopping_midway_returns_the_prefix() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);

    sim.fail_next_get_at(2, libc::EIO);
    let values = device
        .get_controls(&[V4L2_CID_BRIGHTNESS, PIXEL_RATE, FLASH, V4L2_CID_CONTRAST])
        .unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values.get(V4L2_CID_BRIGHTNESS), Some(&ControlValue::Int32(128)));
    assert_eq!(values.get(PIXEL_RATE), Some(&ControlValue::Int64(1 << 30)));
    assert!(!values.contains(FLASH));

    // A failure on the first control is a device error
    sim.fail_next_get_at(0, libc::EIO);
    let err = device.get_controls(&[V4L2_CID_BRIGHTNESS, FLASH]).unwrap_err();
    assert_eq!(err.errno(), Some(-libc::EIO));
}

fn watch(device: &V4l2Device) -> (Rc<RefCell<Vec<u32>>>, camera_hal::Subscription) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let sub = device
        .frame_start()
        .connect(move |sequence: &u32| sink.borrow_mut().push(*sequence));
    (seen, sub)
}

#[test]
fn test_frame_start_events_are_delivered() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);
    let (seen, _sub) = watch(&device);

    // Not subscribed yet
    sim.frame_sync(1);
    assert_eq!(sim.pending_events(), 0);

    device.set_frame_start_enabled(true).unwrap();
    assert!(sim.is_subscribed(V4L2_EVENT_FRAME_SYNC));
    sim.frame_sync(7);
    sim.frame_sync(8);
    event_loop.dispatch_pending();
    event_loop.dispatch_pending();
    assert_eq!(*seen.borrow(), vec![7, 8]);

    device.set_frame_start_enabled(false).unwrap();
    assert!(!sim.is_subscribed(V4L2_EVENT_FRAME_SYNC));
    assert!(!device.is_frame_start_enabled());
}

#[test]
fn test_spurious_event_disables_notifier() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);
    let (seen, _sub) = watch(&device);

    device.set_frame_start_enabled(true).unwrap();
    sim.subscribe_event(V4L2_EVENT_CTRL).unwrap();
    sim.push_event(V4L2_EVENT_CTRL, 0);
    sim.frame_sync(3);

    event_loop.dispatch_pending();
    event_loop.dispatch_pending();
    assert!(!device.is_frame_start_enabled());
    assert!(seen.borrow().is_empty());
    assert_eq!(event_loop.source_count(), 0);
}

#[test]
fn test_dequeue_failure_disables_notifier() {
    let event_loop = EventLoop::new();
    let sim = sensor();
    let device = open(&sim, &event_loop);
    let (seen, _sub) = watch(&device);

    device.set_frame_start_enabled(true).unwrap();
    sim.fail_next_dequeue(libc::EIO);
    event_loop.dispatch_pending();
    assert!(!device.is_frame_start_enabled());

    // Re-enabling installs a fresh notifier
    device.set_frame_start_enabled(true).unwrap();
    sim.frame_sync(4);
    event_loop.dispatch_pending();
    assert_eq!(*seen.borrow(), vec![4]);
}
