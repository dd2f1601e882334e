// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for camera operations
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Capturing a number of frames
//! - Listing, reading and writing V4L2 controls

use camera_hal::constants::{size_label, timing};
use camera_hal::core::controls::{ControlType, ControlValue, ids};
use camera_hal::v4l2::{SetOutcome, V4l2Device, V4l2Node, list_controls as query_controls};
use camera_hal::{
    Camera, CameraManager, Config, ControlList, EventLoop, FrameBufferAllocator, Request,
    RequestStatus, ReuseFlag, Size, StreamRole,
};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// List all available cameras
pub fn list_cameras(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let manager = CameraManager::new(config);
    manager.start()?;

    let cameras = manager.cameras();
    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    println!();
    for (index, camera) in cameras.iter().enumerate() {
        println!("  [{}] {}", index, camera.id());

        let properties = camera.properties();
        if let Some(ControlValue::String(model)) = properties.get(ids::MODEL) {
            println!("      Model: {}", model);
        }
        if let Some(size) = properties
            .get(ids::PIXEL_ARRAY_SIZE)
            .and_then(|v| v.as_bytes())
            .and_then(decode_size)
        {
            match size_label(size) {
                Some(label) => println!("      Pixel array: {} ({})", size, label),
                None => println!("      Pixel array: {}", size),
            }
        }

        if let Ok(config) = camera.generate_configuration(&[StreamRole::Viewfinder])
            && let Some(entry) = config.get(0)
        {
            let formats: Vec<String> = entry
                .formats
                .pixel_formats()
                .iter()
                .map(|f| f.to_string())
                .collect();
            println!("      Default: {}", entry);
            println!("      Formats: {}", formats.join(", "));
        }

        let controls: Vec<&str> = camera.controls().iter().map(|(id, _)| ids::name(id)).collect();
        if !controls.is_empty() {
            println!("      Controls: {}", controls.join(", "));
        }
        println!();
    }

    manager.stop();
    Ok(())
}

/// Capture `frames` requests and print each completion
pub fn capture(
    config: Config,
    selector: &str,
    frames: u32,
    size: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = CameraManager::new(config);
    manager.start()?;

    let camera = select_camera(&manager, selector)?;
    println!("Using camera: {}", camera.id());

    camera.acquire()?;
    let result = run_capture(&camera, manager.event_loop(), frames, size);

    if let Err(err) = camera.stop().and_then(|_| camera.release()) {
        tracing::warn!(%err, "Failed to shut camera down");
    }
    manager.stop();
    result
}

fn run_capture(
    camera: &Camera,
    event_loop: &EventLoop,
    frames: u32,
    size: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut configuration = camera.generate_configuration(&[StreamRole::Viewfinder])?;
    if let Some(size) = size {
        let size = parse_size(size)?;
        if let Some(entry) = configuration.get_mut(0) {
            entry.size = size;
            entry.update_layout();
        }
    }
    camera.configure(&mut configuration)?;

    let stream = configuration
        .get(0)
        .and_then(|entry| entry.stream().cloned())
        .ok_or("Configuration has no stream")?;
    if let Some(entry) = configuration.get(0) {
        println!("Capture format: {}", entry);
    }

    let mut allocator = FrameBufferAllocator::new(camera);
    allocator.allocate(&stream)?;

    let mut requests = Vec::new();
    for (cookie, buffer) in allocator.buffers(&stream).iter().enumerate() {
        let request = camera.create_request(cookie as u64)?;
        request.add_buffer(&stream, buffer.clone())?;
        requests.push(request);
    }

    let completed: Rc<RefCell<Vec<Request>>> = Rc::new(RefCell::new(Vec::new()));
    let _subscription = {
        let completed = completed.clone();
        camera
            .request_completed()
            .connect(move |request| completed.borrow_mut().push(request.clone()))
    };

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    camera.start(None)?;

    let mut queued = 0;
    for request in requests.iter().take(frames as usize) {
        camera.queue_request(request)?;
        queued += 1;
    }

    let timeout = Duration::from_secs(timing::CAPTURE_TIMEOUT_SECS);
    let mut done = 0;
    while done < frames {
        let ready = event_loop.run_until(timeout, || {
            !completed.borrow().is_empty() || stop_flag.load(Ordering::SeqCst)
        });
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }
        if !ready {
            return Err(format!("No request completed within {}s", timing::CAPTURE_TIMEOUT_SECS).into());
        }

        let batch: Vec<Request> = completed.borrow_mut().drain(..).collect();
        for request in batch {
            print_completion(&request);
            done += 1;

            if request.status() == RequestStatus::Complete && queued < frames {
                request.reuse(ReuseFlag::ReuseBuffers)?;
                camera.queue_request(&request)?;
                queued += 1;
            }
        }
    }

    println!("Completed {} of {} requests", done, frames);
    Ok(())
}

fn print_completion(request: &Request) {
    let metadata = request.metadata();
    let timestamp = metadata
        .get(ids::SENSOR_TIMESTAMP)
        .and_then(|v| v.as_i64())
        .unwrap_or_default();
    let ae = match metadata.get(ids::AE_LOCKED).and_then(|v| v.as_bool()) {
        Some(true) => " ae=locked",
        Some(false) => " ae=converging",
        None => "",
    };

    match request.status() {
        RequestStatus::Complete => println!(
            "  #{:<4} cookie {:<2} ts {}{}",
            request.sequence(),
            request.cookie(),
            timestamp,
            ae
        ),
        status => match request.error() {
            Some(err) => println!("  cookie {:<2} {:?}: {}", request.cookie(), status, err),
            None => println!("  cookie {:<2} {:?}", request.cookie(), status),
        },
    }
}

/// List the controls a V4L2 node exposes
pub fn list_controls(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let node = V4l2Node::open(path)?;
    let controls = query_controls(&node);

    if controls.is_empty() {
        println!("No controls found on {}.", path.display());
        return Ok(());
    }

    println!("Controls of {}:", path.display());
    println!();
    for control in controls.values() {
        let elems = if control.is_array() {
            format!("[{}]", control.payload_len())
        } else {
            String::new()
        };
        println!(
            "  {:#010x} {:<32} {}{} {}",
            control.id, control.name, control.control_type, elems, control.info
        );
    }
    Ok(())
}

/// Read controls from a V4L2 node
pub fn get_controls(path: &Path, ids: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new();
    let device = V4l2Device::open(Rc::new(V4l2Node::open(path)?), &event_loop)?;

    let ids = ids
        .iter()
        .map(|s| parse_id(s))
        .collect::<Result<Vec<u32>, _>>()?;
    let values = device.get_controls(&ids)?;
    if values.is_empty() {
        return Err("Unknown control id".into());
    }

    for (id, value) in values.iter() {
        let name = device.control_info(id).map(|c| c.name.as_str()).unwrap_or("?");
        println!("  {:#010x} {:<32} {}", id, name, value);
    }
    Ok(())
}

/// Write controls on a V4L2 node and print what the driver applied
pub fn set_controls(path: &Path, values: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new();
    let device = V4l2Device::open(Rc::new(V4l2Node::open(path)?), &event_loop)?;

    let mut ctrls = ControlList::new();
    for assignment in values {
        let (id, value) = assignment
            .split_once('=')
            .ok_or_else(|| format!("Expected ID=VALUE, got '{}'", assignment))?;
        let id = parse_id(id)?;
        let info = device
            .control_info(id)
            .ok_or_else(|| format!("Unknown control {:#x}", id))?;
        ctrls.set(id, parse_value(info.control_type, value)?);
    }

    let outcome = device.set_controls(&mut ctrls)?;
    for (id, value) in ctrls.iter() {
        println!("  {:#010x} = {}", id, value);
    }
    if let SetOutcome::Partial { failed_at, errno } = outcome {
        return Err(format!(
            "Only {} of {} controls applied: {}",
            failed_at,
            ctrls.len(),
            std::io::Error::from_raw_os_error(errno.abs())
        )
        .into());
    }
    Ok(())
}

/// Select a camera by id or by index in the listing
fn select_camera(manager: &CameraManager, selector: &str) -> Result<Camera, Box<dyn std::error::Error>> {
    if let Some(camera) = manager.get(selector) {
        return Ok(camera);
    }

    let cameras = manager.cameras();
    if cameras.is_empty() {
        return Err("No cameras found".into());
    }
    let index: usize = selector
        .parse()
        .map_err(|_| format!("No camera named '{}'", selector))?;
    cameras.get(index).cloned().ok_or_else(|| {
        format!(
            "Camera index {} out of range (0-{})",
            index,
            cameras.len() - 1
        )
        .into()
    })
}

fn parse_size(text: &str) -> Result<Size, Box<dyn std::error::Error>> {
    let (w, h) = text
        .split_once('x')
        .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got '{}'", text))?;
    Ok(Size::new(w.trim().parse()?, h.trim().parse()?))
}

fn decode_size(bytes: &[u8]) -> Option<Size> {
    let width = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let height = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    Some(Size::new(width, height))
}

fn parse_id(text: &str) -> Result<u32, Box<dyn std::error::Error>> {
    let text = text.trim();
    let id = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => text.parse()?,
    };
    Ok(id)
}

fn parse_value(control_type: ControlType, text: &str) -> Result<ControlValue, Box<dyn std::error::Error>> {
    let text = text.trim();
    let value = match control_type {
        ControlType::Bool => match text {
            "1" | "true" | "on" => ControlValue::Bool(true),
            "0" | "false" | "off" => ControlValue::Bool(false),
            _ => return Err(format!("Expected a boolean, got '{}'", text).into()),
        },
        ControlType::Int64 => ControlValue::Int64(text.parse()?),
        ControlType::Int32 => ControlValue::Int32(text.parse()?),
        ControlType::Byte => ControlValue::Bytes(
            text.split(',')
                .map(|b| b.trim().parse::<u8>())
                .collect::<Result<Vec<u8>, _>>()?,
        ),
        other => return Err(format!("Cannot write {} controls", other).into()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0x00980900").unwrap(), 0x0098_0900);
        assert_eq!(parse_id("42").unwrap(), 42);
        assert!(parse_id("brightness").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480").unwrap(), Size::new(640, 480));
        assert!(parse_size("640").is_err());
    }

    #[test]
    fn test_parse_value_by_type() {
        assert_eq!(parse_value(ControlType::Bool, "on").unwrap(), ControlValue::Bool(true));
        assert_eq!(parse_value(ControlType::Int32, "-3").unwrap(), ControlValue::Int32(-3));
        assert_eq!(
            parse_value(ControlType::Byte, "1, 2,3").unwrap(),
            ControlValue::Bytes(vec![1, 2, 3])
        );
        assert!(parse_value(ControlType::Float, "1.0").is_err());
    }

    #[test]
    fn test_decode_size() {
        assert_eq!(decode_size(&[128, 2, 0, 0, 224, 1, 0, 0]), Some(Size::new(640, 480)));
        assert_eq!(decode_size(&[1, 2]), None);
    }
}
