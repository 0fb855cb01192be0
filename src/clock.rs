use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::atomic::AtomicF64;

/// Time source for replenishing the hierarchy.
///
/// Time is measured in seconds since an arbitrary origin and must never go
/// backwards. Buckets start out stamped at zero, so clocks are expected to
/// start near zero as well.
pub trait Clock {
    /// Current time in seconds since the clock's origin.
    fn now(&self) -> f64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> f64 {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> f64 {
        (**self).now()
    }
}

/// Wall clock based on [`std::time::Instant`], starting at zero when created.
#[derive(Clone)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock backed by `quanta`'s TSC-based [`quanta::Instant`].
#[cfg(feature = "quanta")]
#[derive(Clone)]
pub struct QuantaClock {
    origin: quanta::Instant,
}

#[cfg(feature = "quanta")]
impl Default for QuantaClock {
    fn default() -> Self {
        Self::new(quanta::Clock::new())
    }
}

#[cfg(feature = "quanta")]
impl QuantaClock {
    pub fn new(clock: quanta::Clock) -> Self {
        Self {
            origin: clock.now(),
        }
    }
}

#[cfg(feature = "quanta")]
impl Clock for QuantaClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Coarse `quanta` clock reading the value cached by the upkeep thread.
///
/// Cheap enough to stamp every tick of a busy scheduler. The upkeep thread
/// must be running, otherwise the clock never advances and nothing is ever
/// replenished.
#[cfg(feature = "quanta")]
#[derive(Clone)]
pub struct FastClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

#[cfg(feature = "quanta")]
impl Default for FastClock {
    fn default() -> Self {
        Self::new(quanta::Clock::new())
    }
}

#[cfg(feature = "quanta")]
impl FastClock {
    pub fn new(clock: quanta::Clock) -> Self {
        let origin = clock.recent();
        Self { clock, origin }
    }
}

#[cfg(feature = "quanta")]
impl Clock for FastClock {
    fn now(&self) -> f64 {
        (self.clock.recent() - self.origin).as_secs_f64()
    }
}

/// Clock following [`tokio::time::Instant`], so it honours paused and
/// auto-advanced time in tests.
#[cfg(feature = "tokio")]
#[derive(Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

#[cfg(feature = "tokio")]
impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[cfg(feature = "tokio")]
impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for simulations and tests.
///
/// # Examples
///
/// ```rust
/// use htbucket::{Clock, ClassLimit, Hierarchy, ManualClock};
/// use std::num::NonZeroU32;
///
/// let clock = ManualClock::default();
/// let mut htb = Hierarchy::new();
/// let class = htb.add_root("c", ClassLimit::new(100.0, 100.0).unwrap()).unwrap();
/// let size = NonZeroU32::new(100).unwrap();
///
/// assert!(htb.try_consume(class, size, clock.now()).is_ok());
/// assert!(htb.try_consume(class, size, clock.now()).is_err());
/// clock.advance(1.0);
/// assert!(htb.try_consume(class, size, clock.now()).is_ok());
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicF64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self {
            now: AtomicF64::new(now),
        }
    }

    pub fn set(&self, now: f64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, delta: f64) {
        self.set(self.now() + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.load(Ordering::Relaxed)
    }
}
