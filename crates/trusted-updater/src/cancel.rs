use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const REQUESTED: u8 = 2;
const LOCKED: u8 = 3;

/// Lets the host cancel an update cycle from another task or thread.
///
/// Cancellation is honoured while checking and while downloading. Once the
/// filesystem phase of an apply begins the handle is locked and further
/// requests are refused.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `false` when nothing cancellable is
    /// running: the client is idle or holding a candidate, or the cycle has
    /// entered a phase that cannot be interrupted.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(ARMED, REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == REQUESTED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == REQUESTED
    }

    /// Enter the non-interruptible phase. Returns `false` if a cancellation
    /// request got in first.
    pub(crate) fn lock(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state != REQUESTED).then_some(LOCKED)
            })
            .is_ok()
    }

    /// Accept cancellation for a new operation, dropping any earlier request.
    pub(crate) fn arm(&self) {
        self.state.store(ARMED, Ordering::SeqCst);
    }

    /// The operation is over; requests are refused until the next one.
    pub(crate) fn disarm(&self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}
