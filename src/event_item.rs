//! Event Item: the per-socket record held by a [`ReadinessEngine`](crate::engine::ReadinessEngine).

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::engine::EngineShared;
use crate::mask::EventMask;
use crate::socket::{Socket, WaitQueueHandle, WakeupTarget};

/// Where an event item sits in its lifecycle (spec section 4.2, "State
/// machine of an Event Item"). `NEW` (pre-insert) and `FREED`
/// (post-last-drop) aren't represented explicitly: the former is simply
/// "not yet shared behind an `Arc`", the latter is ordinary Rust drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemState {
    /// Indexed, but not currently on the ready list.
    IndexedIdle,
    /// Indexed and linked into the ready list with a non-empty pending mask.
    IndexedReady,
    /// `remove` has detached this item from the index and wait queue; it
    /// is kept alive only by in-flight callbacks/dispatches and will free
    /// when the last of those drops its reference.
    Removing,
}

pub(crate) struct Locked {
    pub(crate) interest: EventMask,
    pub(crate) pending: EventMask,
    pub(crate) state: ItemState,
}

/// One record per watched socket: carries the socket reference, interest
/// mask, pending mask, and linkage into the engine's ready list.
///
/// The reference count required by spec section 3/4.2 is realized as this
/// struct's `Arc` strong count rather than a hand-rolled atomic: every
/// owner (the index, an in-flight callback, a borrowing dispatch) holds a
/// clone of the `Arc`, and the item frees exactly when the last clone
/// drops. The edge from the item back to its engine is a non-owning `Weak`
/// (spec section 9, "Cyclic reachability").
pub(crate) struct EventItem {
    pub(crate) socket: Arc<dyn Socket>,
    engine: Weak<EngineShared>,
    locked: Mutex<Locked>,
    wait_handle: Mutex<Option<WaitQueueHandle>>,
}

impl fmt::Debug for EventItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventItem")
            .field("endpoint", &self.socket.remote_endpoint())
            .finish()
    }
}

impl EventItem {
    pub(crate) fn new(socket: Arc<dyn Socket>, interest: EventMask, engine: Weak<EngineShared>) -> Self {
        Self {
            socket,
            engine,
            locked: Mutex::new(Locked {
                interest: interest.with_implicit(),
                pending: EventMask::EMPTY,
                state: ItemState::IndexedIdle,
            }),
            wait_handle: Mutex::new(None),
        }
    }

    pub(crate) fn set_wait_handle(&self, handle: WaitQueueHandle) {
        *self.wait_handle.lock().expect("item lock poisoned") = Some(handle);
    }

    /// Detaches this item's wait-queue entry. Called by `remove` before the
    /// engine's strong reference is dropped, so a callback racing removal
    /// can never re-arm the item (spec section 4.2, "Failure semantics").
    pub(crate) fn detach_wait_queue(&self) {
        let handle = self.wait_handle.lock().expect("item lock poisoned").take();
        if let Some(handle) = handle {
            self.socket.sleep_queue().detach(handle);
        }
    }

    pub(crate) fn set_interest(&self, interest: EventMask) {
        let mut locked = self.locked.lock().expect("item lock poisoned");
        locked.interest = interest.with_implicit();
    }

    pub(crate) fn interest(&self) -> EventMask {
        self.locked.lock().expect("item lock poisoned").interest
    }

    pub(crate) fn mark_removing(&self) {
        self.locked.lock().expect("item lock poisoned").state = ItemState::Removing;
    }

    pub(crate) fn is_removing(&self) -> bool {
        self.locked.lock().expect("item lock poisoned").state == ItemState::Removing
    }

    /// Takes the pending mask and clears it, for a consumer draining the
    /// ready list. Mirrors the Herder Run Loop clearing pending events
    /// once an Event Job has been allocated for them (spec section 4.1).
    pub(crate) fn take_pending(&self) -> EventMask {
        let mut locked = self.locked.lock().expect("item lock poisoned");
        std::mem::replace(&mut locked.pending, EventMask::EMPTY)
    }

    /// Evaluates current socket readiness against the interest mask and, if
    /// non-empty, ensures the item is linked into the ready list. Returns
    /// true if the item is (now) on the ready list. Used both by `insert`
    /// (synchronous evaluation) and `set_flags` (re-evaluation).
    pub(crate) fn evaluate_and_link(self: &Arc<Self>) -> bool {
        let mask = self.socket.poll_state().and(self.interest());
        if mask.is_empty() {
            return false;
        }
        self.link_ready(mask)
    }

    /// Links this item onto its engine's ready list if not already linked,
    /// recording `mask` into the pending bits. Returns true if linked (or
    /// already was).
    fn link_ready(self: &Arc<Self>, mask: EventMask) -> bool {
        let mut locked = self.locked.lock().expect("item lock poisoned");
        if locked.state == ItemState::Removing {
            return false;
        }
        locked.pending |= mask;
        if locked.state == ItemState::IndexedReady {
            return true;
        }
        locked.state = ItemState::IndexedReady;
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        engine.push_ready(self.clone());
        true
    }

    /// Called when a consumer drains this item off the ready list. If the
    /// socket's state still intersects the interest mask, the item must be
    /// re-appended before `wait` returns (spec section 4.2, level-trigger).
    pub(crate) fn mark_drained_and_maybe_relink(self: &Arc<Self>) {
        {
            let mut locked = self.locked.lock().expect("item lock poisoned");
            if locked.state == ItemState::Removing {
                return;
            }
            locked.state = ItemState::IndexedIdle;
        }
        self.evaluate_and_link();
    }
}

impl WakeupTarget for EventItem {
    fn on_wakeup(self: Arc<Self>) {
        // The extra reference this callback needs for its duration is the
        // `Arc` that `WaitQueue::notify` already upgraded to call us with.
        if self.is_removing() {
            return;
        }
        self.evaluate_and_link();
        if let Some(engine) = self.engine.upgrade() {
            engine.wake_waiters();
        }
    }
}
