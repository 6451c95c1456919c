//! Background worker loops.
//!
//! Each worker process runs three loops: document processing, version
//! fan-out, and roll-up. Within one process each loop is serialized by a
//! [`DrainGuard`]; across processes, concurrency is bounded only by the
//! store's ability to hand out claims.

pub mod doc;
pub mod rollup;
pub mod version;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process guard ensuring overlapping ticks do not start concurrent
/// drain loops.
#[derive(Debug, Default)]
pub(crate) struct DrainGuard {
    busy: AtomicBool,
}

impl DrainGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enters the guarded section, or returns `None` when a drain is
    /// already running.
    pub(crate) fn try_enter(&self) -> Option<DrainPass<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(DrainPass { guard: self })
        } else {
            None
        }
    }
}

/// Releases the guard on drop.
pub(crate) struct DrainPass<'a> {
    guard: &'a DrainGuard,
}

impl Drop for DrainPass<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Extracts a printable message from a caught panic payload.
///
/// Background loops catch and log panics and keep running; loss of a
/// single iteration is tolerated.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_excludes_reentry_until_released() {
        let guard = DrainGuard::new();
        let pass = guard.try_enter().expect("first entry");
        assert!(guard.try_enter().is_none());
        drop(pass);
        assert!(guard.try_enter().is_some());
    }
}
