// SPDX-License-Identifier: GPL-3.0-only

//! Single-threaded signal/slot registry
//!
//! A [`Signal`] owns a list of callbacks. Connecting returns a
//! [`Subscription`]; dropping the subscription expires the slot, so the
//! emitter never keeps a subscriber alive past its handle.
//!
//! ```text
//!   emitter ── Signal<A> ──┬── slot 0 (active) ──► callback(&A)
//!                          ├── slot 1 (expired, pruned on next emit)
//!                          └── slot 2 (active) ──► callback(&A)
//! ```
//!
//! Callbacks may connect, disconnect or emit re-entrantly: emission works
//! on a snapshot of the slot list.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Slot<A> {
    active: Rc<Cell<bool>>,
    callback: Rc<dyn Fn(&A)>,
}

/// Callback registry emitting values of type `A`
pub struct Signal<A> {
    slots: RefCell<Vec<Slot<A>>>,
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
        }
    }
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it stays connected while the returned handle lives
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn connect(&self, callback: impl Fn(&A) + 'static) -> Subscription {
        let active = Rc::new(Cell::new(true));
        self.slots.borrow_mut().push(Slot {
            active: active.clone(),
            callback: Rc::new(callback),
        });
        Subscription {
            active,
            detached: false,
        }
    }

    /// Invoke every live callback in connection order
    pub fn emit(&self, value: &A) {
        let snapshot: Vec<(Rc<Cell<bool>>, Rc<dyn Fn(&A)>)> = {
            let mut slots = self.slots.borrow_mut();
            slots.retain(|slot| slot.active.get());
            slots
                .iter()
                .map(|slot| (slot.active.clone(), slot.callback.clone()))
                .collect()
        };

        for (active, callback) in snapshot {
            // A callback earlier in the list may have dropped this subscription
            if active.get() {
                callback(value);
            }
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.active.get())
            .count()
    }

    /// Expire every connection
    pub fn disconnect_all(&self) {
        for slot in self.slots.borrow_mut().drain(..) {
            slot.active.set(false);
        }
    }
}

/// Handle keeping a [`Signal`] connection alive
pub struct Subscription {
    active: Rc<Cell<bool>>,
    detached: bool,
}

impl Subscription {
    /// Keep the callback connected for the lifetime of the signal
    pub fn detach(mut self) {
        self.detached = true;
    }

    pub fn is_connected(&self) -> bool {
        self.active.get()
    }

    /// Disconnect now instead of on drop
    pub fn disconnect(&self) {
        self.active.set(false);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.active.set(false);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.active.get())
            .finish()
    }
}
