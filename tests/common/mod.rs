// SPDX-License-Identifier: GPL-3.0-only

//! Shared setup for integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use camera_hal::backends::{IspBackend, VirtualBackend};
use camera_hal::core::DeviceEnumerator;
use camera_hal::pipeline::PipelineHandler;
use camera_hal::sim::{self, CompletionMode, SimRkisp1, SimSubdevice, SimVideoNode, SimVimc};
use camera_hal::{
    Camera, Config, EventLoop, FrameBufferAllocator, Request, Size, Stream, StreamRole,
    Subscription,
};

pub const WAIT: Duration = Duration::from_secs(3);

/// A virtual camera with handles to its simulated hardware
pub struct VimcRig {
    pub event_loop: EventLoop,
    pub enumerator: DeviceEnumerator,
    pub handler: Rc<PipelineHandler>,
    pub camera: Camera,
    pub sensor: Rc<SimSubdevice>,
    pub capture: Rc<SimVideoNode>,
}

pub fn vimc_rig(mode: CompletionMode) -> VimcRig {
    let event_loop = EventLoop::new();
    let enumerator = DeviceEnumerator::new();
    let SimVimc {
        media,
        sensor,
        capture,
        raw: _,
    } = sim::vimc_device(&event_loop, "vimc.0");
    capture.set_mode(mode);
    enumerator.add_device(media);

    let handler = PipelineHandler::new(Box::new(VirtualBackend::new()), &event_loop);
    let camera = handler
        .match_devices(&enumerator, &Config::default())
        .into_iter()
        .next()
        .expect("virtual camera");

    VimcRig {
        event_loop,
        enumerator,
        handler,
        camera,
        sensor,
        capture,
    }
}

/// An ISP camera with handles to its simulated hardware
pub struct IspRig {
    pub event_loop: EventLoop,
    pub enumerator: DeviceEnumerator,
    pub handler: Rc<PipelineHandler>,
    pub camera: Option<Camera>,
    pub sensor: Rc<SimSubdevice>,
    pub mainpath: Rc<SimVideoNode>,
    pub params: Rc<SimVideoNode>,
    pub stats: Rc<SimVideoNode>,
}

pub fn isp_rig(config: &Config, mean: u8) -> IspRig {
    let event_loop = EventLoop::new();
    let enumerator = DeviceEnumerator::new();
    let SimRkisp1 {
        media,
        sensor,
        isp: _,
        mainpath,
        params,
        stats,
    } = sim::rkisp1_device(&event_loop, "rkisp1.0", mean);
    enumerator.add_device(media);

    let handler = PipelineHandler::new(Box::new(IspBackend::new(config)), &event_loop);
    let camera = handler.match_devices(&enumerator, config).into_iter().next();

    IspRig {
        event_loop,
        enumerator,
        handler,
        camera,
        sensor,
        mainpath,
        params,
        stats,
    }
}

/// Acquire, configure one viewfinder stream and allocate its buffers
pub fn configure(camera: &Camera, size: Option<Size>) -> (Stream, FrameBufferAllocator) {
    camera.acquire().unwrap();
    let mut config = camera
        .generate_configuration(&[StreamRole::Viewfinder])
        .unwrap();
    if let Some(size) = size {
        let entry = config.get_mut(0).unwrap();
        entry.size = size;
        entry.update_layout();
    }
    camera.configure(&mut config).unwrap();

    let stream = config.get(0).unwrap().stream().unwrap().clone();
    let mut allocator = FrameBufferAllocator::new(camera);
    allocator.allocate(&stream).unwrap();
    (stream, allocator)
}

/// One request per allocated buffer, cookies counting from zero
pub fn requests(camera: &Camera, stream: &Stream, allocator: &FrameBufferAllocator) -> Vec<Request> {
    allocator
        .buffers(stream)
        .iter()
        .enumerate()
        .map(|(cookie, buffer)| {
            let request = camera.create_request(cookie as u64).unwrap();
            request.add_buffer(stream, buffer.clone()).unwrap();
            request
        })
        .collect()
}

/// Record every `request_completed` emission
pub fn record(camera: &Camera) -> (Rc<RefCell<Vec<Request>>>, Subscription) {
    let completed = Rc::new(RefCell::new(Vec::new()));
    let sink = completed.clone();
    let subscription = camera
        .request_completed()
        .connect(move |request: &Request| sink.borrow_mut().push(request.clone()));
    (completed, subscription)
}

pub fn cookies(requests: &[Request]) -> Vec<u64> {
    requests.iter().map(|r| r.cookie()).collect()
}
