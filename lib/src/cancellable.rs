//! Cooperative cancellation for blocking repository operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// A token threaded through blocking operations. Cancelling it makes the
/// current write abort and unlink its in-progress temp file; the enclosing
/// transaction stays open and must be aborted by the caller.
#[derive(Debug, Default, Clone)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    /// Create a new, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Observe an optional cancellable.
pub(crate) fn check_cancelled(cancellable: Option<&Cancellable>) -> Result<()> {
    cancellable.map_or(Ok(()), Cancellable::check)
}
