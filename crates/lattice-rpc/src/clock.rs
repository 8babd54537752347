//! Injectable time source
//!
//! Keep-alive and inactivity tracking go through this seam so tests can
//! drive time instead of sleeping. `tokio::time::Instant` respects the
//! runtime's paused clock.

use std::sync::Arc;

use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall-clock (or paused-runtime) time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
