//! Cooperative cancellation shared by the loop and the harness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Flags {
    requested: AtomicBool,
    forced: AtomicBool,
}

/// Cloneable cancellation flag. Setting it is sticky.
///
/// A plain request lets in-flight children get their full SIGTERM grace
/// period; a forced one cuts the grace short and SIGKILLs at once.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<Flags>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
    }

    /// Request shutdown and skip any remaining kill grace.
    pub fn force(&self) {
        self.0.forced.store(true, Ordering::SeqCst);
        self.request();
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.0.forced.load(Ordering::SeqCst)
    }
}
