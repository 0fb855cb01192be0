use std::fmt::{Debug, Display, Formatter};

use likely_stable::unlikely;

use crate::ClassLimit;
use crate::error::CapacityExceeded;

/// Stable identifier of a class inside a [`Hierarchy`](crate::Hierarchy).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl Debug for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dispatch eligibility of a single bucket, ignoring its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BucketState {
    /// At least one quantum of guaranteed tokens.
    CanSend,
    /// Out of guaranteed tokens but at least one quantum of ceiling tokens.
    CanBorrow,
    /// Neither bucket holds a quantum.
    CannotSend,
}

impl BucketState {
    pub(crate) fn classify(tokens: f64, ctokens: f64, quantum: f64) -> Self {
        if tokens >= quantum {
            BucketState::CanSend
        } else if ctokens >= quantum {
            BucketState::CanBorrow
        } else {
            BucketState::CannotSend
        }
    }
}

/// A pair of token buckets (guaranteed and ceiling) for one class.
///
/// Nodes only know their own arithmetic. Everything that walks the parent
/// chain lives on [`Hierarchy`](crate::Hierarchy), which owns the nodes.
#[derive(Clone)]
pub struct BucketNode {
    name: String,
    limit: ClassLimit,
    tokens: f64,
    ctokens: f64,
    last_update: f64,
    state: BucketState,
    parent: Option<ClassId>,
    children: usize,
}

impl BucketNode {
    /// A full bucket stamped at time zero.
    pub(crate) fn new(
        name: String,
        limit: ClassLimit,
        parent: Option<ClassId>,
        quantum: f64,
    ) -> Self {
        Self {
            name,
            tokens: limit.burst,
            ctokens: limit.cburst,
            last_update: 0.0,
            state: BucketState::classify(limit.burst, limit.cburst, quantum),
            limit,
            parent,
            children: 0,
        }
    }

    /// Adds the tokens accrued since the last update. Time never flows
    /// backwards: `now <= last_update` leaves the node untouched.
    pub(crate) fn refill(&mut self, now: f64, quantum: f64) {
        let elapsed = now - self.last_update;
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + self.limit.rate * elapsed).min(self.limit.burst);
        self.ctokens = (self.ctokens + self.limit.ceil * elapsed).min(self.limit.cburst);
        self.last_update = now;
        self.state = BucketState::classify(self.tokens, self.ctokens, quantum);
    }

    /// Removes `amount` from both buckets, clamping at zero. Returns the
    /// pre-debit levels when `amount` exceeded both of them.
    pub(crate) fn debit(
        &mut self,
        id: ClassId,
        amount: f64,
        quantum: f64,
    ) -> Option<CapacityExceeded> {
        let exceeded = if unlikely(self.exceeded_by(amount)) {
            Some(CapacityExceeded {
                class: id,
                requested: amount,
                tokens: self.tokens,
                ctokens: self.ctokens,
            })
        } else {
            None
        };
        self.tokens = (self.tokens - amount).max(0.0);
        self.ctokens = (self.ctokens - amount).max(0.0);
        self.state = BucketState::classify(self.tokens, self.ctokens, quantum);
        exceeded
    }

    pub(crate) fn exceeded_by(&self, amount: f64) -> bool {
        amount > self.tokens && amount > self.ctokens
    }

    /// Seconds until the guaranteed bucket holds `target` tokens.
    pub(crate) fn time_to_tokens(&self, target: f64) -> f64 {
        ((target - self.tokens) / self.limit.rate).max(0.0)
    }

    /// Seconds until the ceiling bucket holds `target` tokens.
    pub(crate) fn time_to_ctokens(&self, target: f64) -> f64 {
        ((target - self.ctokens) / self.limit.ceil).max(0.0)
    }

    pub(crate) fn adopt_child(&mut self) {
        self.children += 1;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> &ClassLimit {
        &self.limit
    }

    /// Guaranteed tokens currently held.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Ceiling tokens currently held.
    pub fn ctokens(&self) -> f64 {
        self.ctokens
    }

    /// Time of the last replenishment, in clock seconds.
    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    pub fn state(&self) -> BucketState {
        self.state
    }

    pub fn parent(&self) -> Option<ClassId> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.children == 0
    }
}

impl Debug for BucketNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketNode")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("tokens", &self.tokens)
            .field("ctokens", &self.ctokens)
            .field("last_update", &self.last_update)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUANTUM: f64 = 100.0;

    fn node(rate: f64, ceil: f64) -> BucketNode {
        BucketNode::new(
            "n".to_owned(),
            ClassLimit::new(rate, ceil).unwrap(),
            None,
            QUANTUM,
        )
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(BucketState::CanSend, BucketState::classify(100.0, 0.0, QUANTUM));
        assert_eq!(BucketState::CanBorrow, BucketState::classify(99.9, 100.0, QUANTUM));
        assert_eq!(BucketState::CannotSend, BucketState::classify(99.9, 99.9, QUANTUM));
    }

    #[test]
    fn starts_full_and_refills_up_to_burst() {
        let mut n = node(300.0, 800.0);
        assert_eq!(300.0, n.tokens());
        assert_eq!(800.0, n.ctokens());
        assert_eq!(BucketState::CanSend, n.state());

        assert!(n.debit(ClassId(0), 300.0, QUANTUM).is_none());
        assert_eq!(0.0, n.tokens());
        assert_eq!(500.0, n.ctokens());
        assert_eq!(BucketState::CanBorrow, n.state());

        n.refill(0.5, QUANTUM);
        assert_eq!(150.0, n.tokens());
        assert_eq!(800.0, n.ctokens());
        assert_eq!(BucketState::CanSend, n.state());

        n.refill(10.0, QUANTUM);
        assert_eq!(300.0, n.tokens());
        assert_eq!(800.0, n.ctokens());
    }

    #[test]
    fn refill_ignores_time_going_backwards() {
        let mut n = node(100.0, 100.0);
        n.debit(ClassId(0), 100.0, QUANTUM);
        n.refill(0.5, QUANTUM);
        assert_eq!(50.0, n.tokens());
        n.refill(0.25, QUANTUM);
        assert_eq!(50.0, n.tokens());
        assert_eq!(0.5, n.last_update());
        n.refill(0.5, QUANTUM);
        assert_eq!(50.0, n.tokens());
    }

    #[test]
    fn debit_clamps_and_reports_exceeded() {
        let mut n = node(100.0, 200.0);
        let exceeded = n.debit(ClassId(3), 250.0, QUANTUM).unwrap();
        assert_eq!(ClassId(3), exceeded.class());
        assert_eq!(250.0, exceeded.requested());
        assert_eq!((100.0, 200.0), exceeded.available());
        assert_eq!(0.0, n.tokens());
        assert_eq!(0.0, n.ctokens());
        assert_eq!(BucketState::CannotSend, n.state());
    }

    #[test]
    fn time_to_reach_target() {
        let mut n = node(100.0, 400.0);
        n.debit(ClassId(0), 100.0, QUANTUM);
        assert_eq!(1.0, n.time_to_tokens(100.0));
        assert_eq!(0.0, n.time_to_ctokens(100.0));
        assert_eq!(0.0, n.time_to_tokens(0.0));
    }
}
