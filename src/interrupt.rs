use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Latched interrupt request shared between the OS signal hook and the
/// supervisor.
///
/// Raising is idempotent; the supervisor consumes the request with
/// [`Interrupt::take`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag and routes Ctrl+C / SIGINT into it.
    ///
    /// Can only succeed once per process.
    pub fn install() -> Result<Self, ctrlc::Error> {
        let interrupt = Self::new();
        let handle = interrupt.clone();
        ctrlc::set_handler(move || handle.raise())?;
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
