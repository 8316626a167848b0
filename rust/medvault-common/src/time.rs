//! Injectable time source.
//!
//! Components never read the system clock directly. They hold a [`SharedClock`]
//! so that expiry and retention can be exercised deterministically.

use std::sync::Arc;

pub use chrono::{DateTime, Duration, Utc};

/// A source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// A clock shared between the components of one service instance.
pub type SharedClock = Arc<dyn Clock>;

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl SystemClock {
    /// Wraps the system clock for sharing.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

#[cfg(any(test, feature = "helpers"))]
mod manual {
    use super::*;
    use parking_lot::RwLock;

    /// A clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can hold one handle while the
    /// service under test holds another.
    #[derive(Debug, Clone)]
    pub struct ManualClock(Arc<RwLock<DateTime<Utc>>>);

    impl ManualClock {
        /// Creates a clock frozen at `instant`.
        pub fn at(instant: DateTime<Utc>) -> Self {
            Self(Arc::new(RwLock::new(instant)))
        }

        /// Creates a clock frozen at the current wall time.
        pub fn starting_now() -> Self {
            Self::at(Utc::now())
        }

        /// Moves the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut instant = self.0.write();
            *instant += by;
        }

        /// Jumps the clock to `instant`.
        pub fn set(&self, instant: DateTime<Utc>) {
            *self.0.write() = instant;
        }

        /// A shared handle for injection.
        pub fn shared(&self) -> SharedClock {
            Arc::new(self.clone())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.read()
        }
    }
}

#[cfg(any(test, feature = "helpers"))]
pub use manual::*;
