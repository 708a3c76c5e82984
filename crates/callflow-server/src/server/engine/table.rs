//! Handle table owning every live [`PendingCall`].
//!
//! Calls are addressed by their [`CallId`]. A dispatch loop checks a call out
//! for the duration of one transition and puts it back afterwards, so the
//! call is exclusively owned by whoever is advancing it. A call that reaches
//! FINISHED is simply not put back.

use super::{
    call::{CallState, PendingCall},
    queue::CallId,
};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CallTable {
    calls: Mutex<HashMap<CallId, PendingCall>>,
    next_id: AtomicU64,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh identity and stores a new call in CREATE.
    pub fn create(&self) -> CallId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().insert(id, PendingCall::new(id));
        id
    }

    /// Takes the call out of the table for advancing.
    pub fn checkout(&self, id: CallId) -> Option<PendingCall> {
        self.calls.lock().remove(&id)
    }

    /// Puts a checked-out call back.
    pub fn restore(&self, call: PendingCall) {
        let previous = self.calls.lock().insert(call.id(), call);
        debug_assert!(previous.is_none(), "call restored twice");
    }

    /// Removes every call still in the table.
    pub fn drain(&self) -> Vec<PendingCall> {
        self.calls.lock().drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Number of stored calls in `state`. Checked-out calls are not counted.
    pub fn count_in(&self, state: CallState) -> usize {
        self.calls
            .lock()
            .values()
            .filter(|call| call.state() == state)
            .count()
    }
}
