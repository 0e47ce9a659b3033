//! Interrupt-to-main-loop completion signalling.
//!
//! The radio's DIO interrupt must not touch the shared bus, so the only thing
//! it does is raise a flag. [`CompletionFlag::new`] hands out the two halves:
//!
//! - [`CompletionSignal`] belongs to the radio driver and is raised from
//!   interrupt context, once per started operation.
//! - [`CompletionFlag`] belongs to the main loop (the radio state machine),
//!   which reads-and-clears it exactly once per observed completion.
//!
//! With one writer and one reader an atomic swap is all the synchronisation
//! needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct CompletionFlag {
    raised: Arc<AtomicBool>,
}

/// Write half of a [`CompletionFlag`], owned by the radio driver.
///
/// Cloning is allowed so a driver can hand the handle to whatever models its
/// interrupt line, but only interrupt context may call [`CompletionSignal::raise`].
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    raised: Arc<AtomicBool>,
}

impl CompletionFlag {
    /// Create a cleared flag and its signal handle.
    pub fn new() -> (Self, CompletionSignal) {
        let raised = Arc::new(AtomicBool::new(false));
        (
            Self { raised: Arc::clone(&raised) },
            CompletionSignal { raised },
        )
    }

    /// Read-and-clear. Returns `true` at most once per raise.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    /// Look without consuming.
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Drop a stale completion, used before starting a new operation.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }
}

impl CompletionSignal {
    /// Interrupt-context entry point.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_cleared() {
        let (flag, _signal) = CompletionFlag::new();
        assert!(!flag.is_set());
        assert!(!flag.take());
    }

    #[test]
    fn test_take_consumes_a_single_raise() {
        let (flag, signal) = CompletionFlag::new();
        signal.raise();
        assert!(flag.is_set());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn test_repeated_raises_collapse() {
        let (flag, signal) = CompletionFlag::new();
        signal.raise();
        signal.raise();
        assert!(flag.take());
        assert!(!flag.is_set());
    }

    #[test]
    fn test_raise_from_another_thread() {
        let (flag, signal) = CompletionFlag::new();
        std::thread::spawn(move || signal.raise())
            .join()
            .unwrap();
        assert!(flag.take());
    }

    #[test]
    fn test_clear_discards_pending_completion() {
        let (flag, signal) = CompletionFlag::new();
        signal.raise();
        flag.clear();
        assert!(!flag.take());
    }
}
