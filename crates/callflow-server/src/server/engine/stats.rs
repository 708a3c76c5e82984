use super::call::CallState;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of the engine's pending calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls in CREATE, waiting for a request.
    pub awaiting: usize,
    /// Calls in PROCESSING, waiting for their reply to be sent.
    pub processing: usize,
    /// Calls ever created.
    pub created: u64,
    /// Calls that reached FINISHED after serving a request.
    pub finished: u64,
    /// Finished calls whose reply was an error or never reached the client.
    pub failed: u64,
}

impl EngineStats {
    /// Calls currently owned by the engine.
    pub const fn live(&self) -> usize {
        self.awaiting + self.processing
    }
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    awaiting: AtomicUsize,
    processing: AtomicUsize,
    created: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
}

impl StatsCounters {
    pub fn call_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.awaiting.fetch_add(1, Ordering::AcqRel);
    }

    pub fn call_started(&self) {
        self.processing.fetch_add(1, Ordering::AcqRel);
        self.awaiting.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn call_released(&self, from: CallState, failed: bool) {
        match from {
            CallState::Create => {
                self.awaiting.fetch_sub(1, Ordering::AcqRel);
            }
            CallState::Processing => {
                self.processing.fetch_sub(1, Ordering::AcqRel);
                self.finished.fetch_add(1, Ordering::Relaxed);
                if failed {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            CallState::Finished => {}
        }
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            awaiting: self.awaiting.load(Ordering::Acquire),
            processing: self.processing.load(Ordering::Acquire),
            created: self.created.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
