//! Injectable time sources.
//!
//! Every time-dependent check reads "now" from a [`Clock`]. The verifier wraps the caller's
//! clock in an [`OffsetClock`] once, so both platforms see the same shifted instant.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

/// Source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant. Used for debug replay and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Shifts another clock by a signed offset.
///
/// A positive offset moves verification into the future. Shifts that leave chrono's
/// representable range saturate at the range boundary.
#[derive(Debug, Clone)]
pub struct OffsetClock {
    inner: Arc<dyn Clock>,
    offset: Duration,
}

impl OffsetClock {
    pub fn new(inner: Arc<dyn Clock>, offset: Duration) -> Self {
        Self { inner, offset }
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// The unshifted instant of the wrapped clock.
    pub fn base_now(&self) -> DateTime<Utc> {
        self.inner.now()
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        shift(self.inner.now(), self.offset)
    }
}

/// `at + offset`, saturating instead of panicking on overflow.
pub(crate) fn shift(at: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    at.checked_add_signed(offset).unwrap_or(if offset < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}
