use std::num::NonZeroU32;

use crate::ConfigError;

/// Rate configuration of a single class in the hierarchy.
///
/// A class is entitled to `rate` bytes per second regardless of what its
/// siblings do, and may reach up to `ceil` bytes per second by borrowing
/// unused capacity from its ancestors. `burst` and `cburst` cap how many
/// guaranteed and ceiling tokens the class can accumulate while idle; they
/// default to one second's worth of `rate` and `ceil` respectively.
///
/// # Examples
///
/// ```rust
/// use htbucket::ClassLimit;
///
/// // 300 B/s guaranteed, may borrow up to 800 B/s
/// let limit = ClassLimit::new(300.0, 800.0).unwrap();
/// assert_eq!(limit.burst(), 300.0);
/// assert_eq!(limit.cburst(), 800.0);
///
/// // ceil below rate is rejected
/// assert!(ClassLimit::new(800.0, 300.0).is_err());
/// ```
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ClassLimit {
    pub(crate) rate: f64,
    pub(crate) ceil: f64,
    pub(crate) burst: f64,
    pub(crate) cburst: f64,
}

impl std::fmt::Debug for ClassLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClassLimit(rate={}, ceil={}, burst={}, cburst={})",
            self.rate, self.ceil, self.burst, self.cburst
        )
    }
}

pub(crate) fn positive(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

impl ClassLimit {
    /// Creates a limit with the given guaranteed and ceiling rates in bytes
    /// per second.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotPositive`] if either rate is zero, negative or not
    /// finite, [`ConfigError::CeilBelowRate`] if `ceil < rate`.
    pub fn new(rate: f64, ceil: f64) -> Result<Self, ConfigError> {
        let rate = positive("rate", rate)?;
        let ceil = positive("ceil", ceil)?;
        if ceil < rate {
            return Err(ConfigError::CeilBelowRate { rate, ceil });
        }
        Ok(Self {
            rate,
            ceil,
            burst: rate,
            cburst: ceil,
        })
    }

    /// A class that can never borrow: `ceil == rate`.
    ///
    /// ```rust
    /// use htbucket::ClassLimit;
    /// use std::num::NonZeroU32;
    ///
    /// let limit = ClassLimit::fixed(NonZeroU32::new(100).unwrap());
    /// assert_eq!(limit.rate(), limit.ceil());
    /// ```
    pub const fn fixed(rate: NonZeroU32) -> Self {
        let rate = rate.get() as f64;
        Self {
            rate,
            ceil: rate,
            burst: rate,
            cburst: rate,
        }
    }

    /// Sets the maximum number of guaranteed tokens the class can hold.
    pub fn with_burst(mut self, burst: f64) -> Result<Self, ConfigError> {
        self.burst = positive("burst", burst)?;
        Ok(self)
    }

    /// Sets the maximum number of ceiling tokens the class can hold.
    pub fn with_cburst(mut self, cburst: f64) -> Result<Self, ConfigError> {
        self.cburst = positive("cburst", cburst)?;
        Ok(self)
    }

    /// Guaranteed rate in bytes per second.
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Ceiling rate in bytes per second.
    pub const fn ceil(&self) -> f64 {
        self.ceil
    }

    /// Guaranteed bucket capacity in bytes.
    pub const fn burst(&self) -> f64 {
        self.burst
    }

    /// Ceiling bucket capacity in bytes.
    pub const fn cburst(&self) -> f64 {
        self.cburst
    }
}
