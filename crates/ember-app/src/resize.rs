//! Framebuffer-resize notification shared between the window and the frame loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set by the window system when the framebuffer size changes, consumed by
/// the frame scheduler after it presents.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal {
    pending: Arc<AtomicBool>,
}

impl ResizeSignal {
    /// Create a signal with no pending resize.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the framebuffer size changed.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume the pending notification, returning whether there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Whether a notification is waiting, without consuming it.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_notification() {
        let signal = ResizeSignal::new();
        assert!(!signal.take());

        signal.notify();
        signal.notify();
        assert!(signal.is_pending());
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn clones_share_state() {
        let window_side = ResizeSignal::new();
        let loop_side = window_side.clone();

        let handle = std::thread::spawn(move || window_side.notify());
        handle.join().unwrap();

        assert!(loop_side.take());
    }
}
