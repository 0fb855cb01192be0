use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use crate::ClassId;

/// Rejected hierarchy or scheduler configuration.
///
/// Every variant is raised synchronously while the hierarchy is being built
/// or shapers are being registered, so a running scheduler never observes an
/// invalid tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be a positive, finite number (got {value})")]
    NotPositive { field: &'static str, value: f64 },
    #[error("ceil ({ceil}) must not be below rate ({rate})")]
    CeilBelowRate { rate: f64, ceil: f64 },
    #[error("unknown class {0}")]
    UnknownClass(ClassId),
    #[error("class '{child}' names unknown parent '{parent}'")]
    UnknownParent { child: String, parent: String },
    #[error("class name '{0}' is already in use")]
    DuplicateName(String),
    #[error("parent chain of class '{0}' is cyclic")]
    Cycle(String),
    #[error("class {0} has children and cannot be bound to a shaper")]
    NotALeaf(ClassId),
    #[error("class {0} is already bound to a shaper")]
    AlreadyBound(ClassId),
    #[error("class {0} is bound to a shaper and cannot have children")]
    ParentIsShaper(ClassId),
}

/// A class was charged more than both of its buckets held.
///
/// This is an observation, not a failure: the debit has already been applied
/// and clamped at zero by the time the caller sees it.
#[derive(Clone, PartialEq)]
pub struct CapacityExceeded {
    pub(crate) class: ClassId,
    pub(crate) requested: f64,
    pub(crate) tokens: f64,
    pub(crate) ctokens: f64,
}

impl CapacityExceeded {
    /// The class nearest to the charged leaf whose capacity was exceeded.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Bytes that were charged.
    pub fn requested(&self) -> f64 {
        self.requested
    }

    /// Guaranteed and ceiling tokens the class held before the charge.
    pub fn available(&self) -> (f64, f64) {
        (self.tokens, self.ctokens)
    }
}

impl Debug for CapacityExceeded {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capacity exceeded on {} (requested={}, tokens={}, ctokens={})",
            self.class, self.requested, self.tokens, self.ctokens
        )
    }
}

impl Display for CapacityExceeded {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "class {} was charged {} bytes while holding {} guaranteed and {} ceiling tokens",
            self.class, self.requested, self.tokens, self.ctokens
        )
    }
}

/// The hierarchy cannot admit a charge right now.
pub struct RateLimited {
    pub(crate) earliest_retry_after: Duration,
}

impl RateLimited {
    /// The suggested duration to wait before retrying.
    pub fn earliest_retry_after(&self) -> Duration {
        self.earliest_retry_after
    }
}

impl Debug for RateLimited {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limited; suggested nap duration is {:?}",
            self.earliest_retry_after
        )
    }
}

impl Display for RateLimited {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limited; suggested nap duration is {:?}",
            self.earliest_retry_after
        )
    }
}

impl std::error::Error for RateLimited {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rate_limited() {
        let rl = RateLimited {
            earliest_retry_after: Duration::from_secs(10),
        };
        assert_eq!(
            "rate limited; suggested nap duration is 10s",
            rl.to_string()
        );
    }

    #[test]
    fn display_capacity_exceeded() {
        let ce = CapacityExceeded {
            class: ClassId(2),
            requested: 150.0,
            tokens: 20.0,
            ctokens: 40.0,
        };
        assert_eq!(
            "class #2 was charged 150 bytes while holding 20 guaranteed and 40 ceiling tokens",
            ce.to_string()
        );
        assert_eq!((20.0, 40.0), ce.available());
    }

    #[test]
    fn display_config_error() {
        let err = ConfigError::CeilBelowRate {
            rate: 500.0,
            ceil: 300.0,
        };
        assert_eq!("ceil (300) must not be below rate (500)", err.to_string());
        let err = ConfigError::NotPositive {
            field: "rate",
            value: 0.0,
        };
        assert_eq!(
            "rate must be a positive, finite number (got 0)",
            err.to_string()
        );
    }
}
