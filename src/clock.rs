//! The clock is an injected collaborator rather than a core concern: tests
//! can swap in a fixed clock without touching any networking code.
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Timestamp;

/// Something that can produce the current time as a [`Timestamp`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The real system clock, backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Timestamp::from_nanos(nanos)
    }
}
