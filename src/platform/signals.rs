//! Interrupt flag for sweeps and sync runs.
//!
//! SIGINT/SIGTERM set a shared flag that the sweep checks before each archive.
//! A second SIGINT while the flag is already set terminates the process.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancel flag, optionally wired to OS signals.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// A flag no signal will ever set.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Register SIGINT/SIGTERM. Registration is best-effort; failures are
    /// reported on stderr and leave the flag detached.
    pub fn install() -> Self {
        let handler = Self::default();
        handler.register_signals();
        handler
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// The flag itself, for [`crate::shield::sweep::SweepOrchestrator::with_cancel_flag`].
    pub fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    #[cfg(feature = "signals")]
    fn register_signals(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};

        // Order matters: the conditional shutdown must see the flag before the
        // plain registration sets it.
        if let Err(e) = signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&self.flag)) {
            eprintln!("[SSP-SIGNAL] failed to register second-SIGINT exit: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.flag)) {
            eprintln!("[SSP-SIGNAL] failed to register SIGINT: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.flag)) {
            eprintln!("[SSP-SIGNAL] failed to register SIGTERM: {e}");
        }
    }

    #[cfg(not(feature = "signals"))]
    #[allow(clippy::unused_self)]
    fn register_signals(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_visible_through_shared_handle() {
        let flag = InterruptFlag::detached();
        let shared = flag.shared();
        assert!(!flag.is_set());
        flag.request();
        assert!(shared.load(Ordering::Relaxed));
        assert!(flag.clone().is_set());
    }
}
