use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cooperative cancellation flag.
///
/// Clones observe the same flag. Setting it never interrupts work by itself;
/// every layer that can stop early polls it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.flag.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.flag.load(Ordering::SeqCst) }
}
