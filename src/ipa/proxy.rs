// SPDX-License-Identifier: GPL-3.0-only

//! Worker thread hosting an algorithm module
//!
//! Lifecycle calls (`init`, `configure`, `start`, `stop`) are synchronous
//! with a timeout. Per-frame events are fire-and-forget; their results come
//! back as [`IpaNotification`]s. An algorithm error stops the worker and is
//! reported once as [`IpaNotification::Fatal`]; the pipeline keeps running.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::{EntityControls, IpaAction, IpaBuffer, IpaEvent, IpaInterface, IpaNotification, IpaSensorInfo};
use crate::errors::{HalError, HalResult};
use crate::event_loop::LoopWaker;

enum Command {
    Init {
        hw_revision: u32,
        reply: SyncSender<HalResult<()>>,
    },
    Configure {
        sensor: IpaSensorInfo,
        entity_controls: EntityControls,
        reply: SyncSender<HalResult<()>>,
    },
    Start {
        reply: SyncSender<HalResult<()>>,
    },
    Stop {
        reply: SyncSender<()>,
    },
    MapBuffers(Vec<IpaBuffer>),
    UnmapBuffers(Vec<u64>),
    Event(IpaEvent),
    Exit,
}

/// Pipeline-side handle of an algorithm worker
pub struct IpaProxy {
    name: String,
    commands: UnboundedSender<Command>,
    thread_handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

struct Worker {
    name: String,
    ipa: Box<dyn IpaInterface>,
    notifications: UnboundedSender<IpaNotification>,
    waker: LoopWaker,
}

impl Worker {
    fn notify(&self, notification: IpaNotification) {
        if self.notifications.send(notification).is_ok() {
            self.waker.wake();
        }
    }

    fn flush(&self, actions: &mut Vec<IpaAction>) {
        for action in actions.drain(..) {
            self.notify(IpaNotification::Action(action));
        }
    }

    fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        debug!(ipa = %self.name, "IPA worker started");
        let mut actions = Vec::new();

        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::Init { hw_revision, reply } => {
                    let _ = reply.send(self.ipa.init(hw_revision));
                }
                Command::Configure {
                    sensor,
                    entity_controls,
                    reply,
                } => {
                    let _ = reply.send(self.ipa.configure(&sensor, &entity_controls));
                }
                Command::Start { reply } => {
                    let result = self.ipa.start(&mut actions);
                    self.flush(&mut actions);
                    let _ = reply.send(result);
                }
                Command::Stop { reply } => {
                    self.ipa.stop();
                    let _ = reply.send(());
                }
                Command::MapBuffers(buffers) => self.ipa.map_buffers(buffers),
                Command::UnmapBuffers(ids) => self.ipa.unmap_buffers(&ids),
                Command::Event(event) => {
                    if let Err(err) = self.ipa.process_event(event, &mut actions) {
                        error!(ipa = %self.name, %err, "IPA failed, stopping worker");
                        actions.clear();
                        self.notify(IpaNotification::Fatal(err.to_string()));
                        break;
                    }
                    self.flush(&mut actions);
                }
                Command::Exit => break,
            }
        }

        debug!(ipa = %self.name, "IPA worker exiting");
    }
}

impl IpaProxy {
    /// Move an algorithm onto its own thread
    ///
    /// `waker` is poked whenever a notification is sent so the event loop
    /// can pick it up promptly.
    pub fn spawn(
        ipa: Box<dyn IpaInterface>,
        waker: LoopWaker,
        timeout: Duration,
    ) -> HalResult<(Self, UnboundedReceiver<IpaNotification>)> {
        let name = ipa.name().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            name: name.clone(),
            ipa,
            notifications: notify_tx,
            waker,
        };
        let thread_handle = thread::Builder::new()
            .name(format!("ipa-{}", name))
            .spawn(move || worker.run(command_rx))
            .map_err(|e| HalError::Resource(format!("failed to spawn IPA worker: {}", e)))?;

        info!(ipa = %name, "IPA proxy created");
        Ok((
            Self {
                name,
                commands: command_tx,
                thread_handle: Some(thread_handle),
                timeout,
            },
            notify_rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker is still accepting commands
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn send(&self, command: Command) -> HalResult<()> {
        self.commands
            .send(command)
            .map_err(|_| HalError::Protocol(format!("IPA {} is not running", self.name)))
    }

    fn call<T>(&self, op: &str, make: impl FnOnce(SyncSender<T>) -> Command) -> HalResult<T> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.send(make(reply_tx))?;
        reply_rx.recv_timeout(self.timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => {
                warn!(ipa = %self.name, op, "IPA call timed out");
                HalError::Protocol(format!("IPA {} timed out in {}", self.name, op))
            }
            RecvTimeoutError::Disconnected => {
                HalError::Protocol(format!("IPA {} exited during {}", self.name, op))
            }
        })
    }

    pub fn init(&self, hw_revision: u32) -> HalResult<()> {
        self.call("init", |reply| Command::Init { hw_revision, reply })?
    }

    pub fn configure(&self, sensor: IpaSensorInfo, entity_controls: EntityControls) -> HalResult<()> {
        self.call("configure", |reply| Command::Configure {
            sensor,
            entity_controls,
            reply,
        })?
    }

    pub fn start(&self) -> HalResult<()> {
        self.call("start", |reply| Command::Start { reply })?
    }

    pub fn stop(&self) -> HalResult<()> {
        self.call("stop", |reply| Command::Stop { reply })
    }

    pub fn map_buffers(&self, buffers: Vec<IpaBuffer>) -> HalResult<()> {
        self.send(Command::MapBuffers(buffers))
    }

    pub fn unmap_buffers(&self, ids: Vec<u64>) -> HalResult<()> {
        self.send(Command::UnmapBuffers(ids))
    }

    /// Queue a per-frame event without waiting
    pub fn queue_event(&self, event: IpaEvent) -> HalResult<()> {
        self.send(Command::Event(event))
    }
}

impl Drop for IpaProxy {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Exit);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!(ipa = %self.name, "IPA worker panicked");
            }
        }
        debug!(ipa = %self.name, "IPA proxy destroyed");
    }
}
