//! Traits that provide an abstract interface for time-related operations,
//! modelled after [`std::time`]. The engine schedules its timers against these
//! traits so that it can run against either the real clock or a simulated one.

use std::fmt::Debug;

/// A trait for time instants that follow the API of [`std::time::Instant`].
pub trait Instant:
    'static
    + Sized
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + std::ops::Add<Self::Duration, Output = Self>
    + std::ops::Sub<Self::Duration, Output = Self>
    + std::ops::Sub<Self, Output = Self::Duration>
    + std::cmp::PartialOrd
    + std::cmp::Ord
    + std::cmp::PartialEq
    + std::cmp::Eq
{
    type Duration: Duration;

    /// See [`std::time::Instant::saturating_duration_since`].
    fn saturating_duration_since(&self, earlier: Self) -> Self::Duration;
    /// See [`std::time::Instant::checked_add`].
    fn checked_add(&self, duration: Self::Duration) -> Option<Self>;
}

/// A trait for time durations that follow the API of [`std::time::Duration`].
pub trait Duration:
    'static
    + Sized
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::cmp::PartialOrd
    + std::cmp::Ord
    + std::cmp::PartialEq
    + std::cmp::Eq
{
    /// See [`std::time::Duration::MAX`].
    const MAX: Self;
    /// See [`std::time::Duration::ZERO`].
    const ZERO: Self;

    /// See [`std::time::Duration::from_micros`].
    fn from_micros(micros: u64) -> Self;
    /// See [`std::time::Duration::from_millis`].
    fn from_millis(millis: u64) -> Self;
    /// See [`std::time::Duration::from_secs`].
    fn from_secs(secs: u64) -> Self;
    /// See [`std::time::Duration::as_secs`].
    fn as_secs(&self) -> u64;
    /// See [`std::time::Duration::subsec_micros`].
    fn subsec_micros(&self) -> u32;
    /// See [`std::time::Duration::is_zero`].
    fn is_zero(&self) -> bool;
    /// See [`std::time::Duration::checked_add`].
    fn checked_add(self, rhs: Self) -> Option<Self>;
    /// See [`std::time::Duration::saturating_add`].
    fn saturating_add(self, rhs: Self) -> Self;
}

/// Calls into [`std::time::Instant`] methods of the same name.
impl Instant for std::time::Instant {
    type Duration = std::time::Duration;

    #[inline]
    fn saturating_duration_since(&self, earlier: Self) -> Self::Duration {
        self.saturating_duration_since(earlier)
    }

    #[inline]
    fn checked_add(&self, duration: Self::Duration) -> Option<Self> {
        self.checked_add(duration)
    }
}

/// Calls into [`std::time::Duration`] methods of the same name.
impl Duration for std::time::Duration {
    const MAX: Self = Self::MAX;
    const ZERO: Self = Self::ZERO;

    #[inline]
    fn from_micros(micros: u64) -> Self {
        Self::from_micros(micros)
    }

    #[inline]
    fn from_millis(millis: u64) -> Self {
        Self::from_millis(millis)
    }

    #[inline]
    fn from_secs(secs: u64) -> Self {
        Self::from_secs(secs)
    }

    #[inline]
    fn as_secs(&self) -> u64 {
        self.as_secs()
    }

    #[inline]
    fn subsec_micros(&self) -> u32 {
        self.subsec_micros()
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.is_zero()
    }

    #[inline]
    fn checked_add(self, rhs: Self) -> Option<Self> {
        self.checked_add(rhs)
    }

    #[inline]
    fn saturating_add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}
