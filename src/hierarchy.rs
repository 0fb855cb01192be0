use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::time::Duration;

use tracing::warn;

use crate::bucket::{BucketNode, BucketState, ClassId};
use crate::error::{CapacityExceeded, ConfigError, RateLimited};
use crate::limit::{ClassLimit, positive};

/// Default minimum schedulable unit, in bytes.
pub const DEFAULT_QUANTUM: f64 = 100.0;

/// An arena of token buckets linked into one or more trees.
///
/// Every class is addressed by the [`ClassId`] returned when it was added.
/// Trees are built top-down: a class can only name a parent that already
/// exists, so parent chains are acyclic by construction and a class is never
/// re-parented.
///
/// A parent bucket is charged for everything its subtree sends, so its
/// tokens represent the aggregate capacity left to all of its descendants.
///
/// # Panics
///
/// Methods taking a [`ClassId`] panic if the id was handed out by a
/// different hierarchy.
///
/// # Examples
///
/// ```rust
/// use htbucket::{BucketState, ClassLimit, Hierarchy};
///
/// let mut htb = Hierarchy::new();
/// let root = htb.add_root("root", ClassLimit::new(800.0, 800.0).unwrap()).unwrap();
/// let web = htb.add_child(root, "web", ClassLimit::new(300.0, 800.0).unwrap()).unwrap();
///
/// // spend the guaranteed allowance of `web`
/// htb.account(web, 300.0);
/// assert_eq!(BucketState::CanBorrow, htb.state(web));
/// // but the root still has room, so `web` may borrow
/// assert!(htb.can_borrow(web));
/// assert!(htb.borrow(web));
/// ```
#[derive(Debug, Clone)]
pub struct Hierarchy {
    nodes: Vec<BucketNode>,
    names: HashMap<String, ClassId>,
    quantum: f64,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy {
    /// An empty hierarchy using [`DEFAULT_QUANTUM`].
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            names: HashMap::new(),
            quantum: DEFAULT_QUANTUM,
        }
    }

    /// An empty hierarchy classifying buckets against `quantum` bytes.
    pub fn with_quantum(quantum: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            quantum: positive("quantum", quantum)?,
            ..Self::new()
        })
    }

    /// Builds a hierarchy from a declarative description.
    ///
    /// Classes may be listed in any order; parents are resolved by name.
    ///
    /// # Errors
    ///
    /// Duplicate names, parents that are never declared, parent chains that
    /// loop back on themselves, and invalid limits are all rejected.
    pub fn from_config(config: &HierarchyConfig) -> Result<Self, ConfigError> {
        let mut hierarchy = Self::with_quantum(config.quantum)?;

        let mut declared = HashSet::with_capacity(config.classes.len());
        for class in &config.classes {
            if !declared.insert(class.name.as_str()) {
                return Err(ConfigError::DuplicateName(class.name.clone()));
            }
        }
        for class in &config.classes {
            if let Some(parent) = class.parent.as_deref() {
                if !declared.contains(parent) {
                    return Err(ConfigError::UnknownParent {
                        child: class.name.clone(),
                        parent: parent.to_owned(),
                    });
                }
            }
        }

        let mut pending: Vec<&ClassConfig> = config.classes.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for class in pending {
                let limit = class.limit()?;
                match class.parent.as_deref() {
                    None => {
                        hierarchy.add_root(class.name.clone(), limit)?;
                    }
                    Some(parent) => match hierarchy.lookup(parent) {
                        Some(parent) => {
                            hierarchy.add_child(parent, class.name.clone(), limit)?;
                        }
                        None => deferred.push(class),
                    },
                }
            }
            // nothing could be attached in a full pass: the rest only point at each other
            if deferred.len() == before {
                return Err(ConfigError::Cycle(deferred[0].name.clone()));
            }
            pending = deferred;
        }
        Ok(hierarchy)
    }

    /// Adds a class without a parent.
    pub fn add_root(
        &mut self,
        name: impl Into<String>,
        limit: ClassLimit,
    ) -> Result<ClassId, ConfigError> {
        self.insert(name.into(), limit, None)
    }

    /// Adds a class below `parent`.
    pub fn add_child(
        &mut self,
        parent: ClassId,
        name: impl Into<String>,
        limit: ClassLimit,
    ) -> Result<ClassId, ConfigError> {
        if self.get(parent).is_none() {
            return Err(ConfigError::UnknownClass(parent));
        }
        self.insert(name.into(), limit, Some(parent))
    }

    fn insert(
        &mut self,
        name: String,
        limit: ClassLimit,
        parent: Option<ClassId>,
    ) -> Result<ClassId, ConfigError> {
        if self.names.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        let id = ClassId(self.nodes.len() as u32);
        if let Some(parent) = parent {
            self.nodes[parent.index()].adopt_child();
        }
        self.names.insert(name.clone(), id);
        self.nodes
            .push(BucketNode::new(name, limit, parent, self.quantum));
        Ok(id)
    }

    pub fn quantum(&self) -> f64 {
        self.quantum
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: ClassId) -> Option<&BucketNode> {
        self.nodes.get(id.index())
    }

    pub fn node(&self, id: ClassId) -> &BucketNode {
        &self.nodes[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.names.get(name).copied()
    }

    pub fn is_leaf(&self, id: ClassId) -> bool {
        self.node(id).is_leaf()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (ClassId, &BucketNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (ClassId(idx as u32), node))
    }

    /// The parent of `id`, its parent, and so on up to the root.
    pub fn ancestors(&self, id: ClassId) -> Ancestors<'_> {
        Ancestors {
            hierarchy: self,
            next: self.node(id).parent(),
        }
    }

    fn chain(&self, id: ClassId) -> impl Iterator<Item = &BucketNode> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .map(|id| self.node(id))
    }

    /// Brings `id` and all of its ancestors up to `now`, ancestors first.
    ///
    /// Repeating the call with the same (or an earlier) `now` changes
    /// nothing, so siblings sharing a parent can each replenish it in the
    /// same tick.
    pub fn replenish(&mut self, id: ClassId, now: f64) {
        if let Some(parent) = self.node(id).parent() {
            self.replenish(parent, now);
        }
        let quantum = self.quantum;
        self.nodes[id.index()].refill(now, quantum);
    }

    /// Charges `amount` bytes to `id` and every one of its ancestors.
    ///
    /// The charge is always applied, clamping each bucket at zero. If some
    /// class on the chain held less than `amount` in both buckets, that is
    /// logged and the one nearest to `id` is returned.
    pub fn account(&mut self, id: ClassId, amount: f64) -> Option<CapacityExceeded> {
        let quantum = self.quantum;
        let mut first = None;
        let mut current = Some(id);
        while let Some(class) = current {
            let node = &mut self.nodes[class.index()];
            if let Some(exceeded) = node.debit(class, amount, quantum) {
                warn!(
                    class = %class,
                    name = node.name(),
                    requested = amount,
                    tokens = exceeded.tokens,
                    ctokens = exceeded.ctokens,
                    "charge exceeds all tokens"
                );
                first.get_or_insert(exceeded);
            }
            current = node.parent();
        }
        first
    }

    /// Whether charging `amount` to `id` would exceed both buckets of some
    /// class on its chain.
    pub fn would_exceed(&self, id: ClassId, amount: f64) -> bool {
        self.chain(id).any(|node| node.exceeded_by(amount))
    }

    /// True if some node on the chain could not cover `amount` even with
    /// both of its buckets full, so waiting for tokens is pointless.
    pub fn exceeds_capacity(&self, id: ClassId, amount: f64) -> bool {
        self.chain(id)
            .any(|node| amount > node.limit().burst().max(node.limit().cburst()))
    }

    /// State of `id` alone, ignoring its ancestors.
    pub fn state(&self, id: ClassId) -> BucketState {
        self.node(id).state()
    }

    /// `id` may send on its guaranteed rate: it and every ancestor are
    /// [`BucketState::CanSend`].
    pub fn can_send(&self, id: ClassId) -> bool {
        let node = self.node(id);
        node.state() == BucketState::CanSend && node.parent().is_none_or(|p| self.can_send(p))
    }

    /// `id` is out of guaranteed tokens but within its ceiling, and its
    /// parent can supply the difference from its own guaranteed or borrowed
    /// pool.
    pub fn can_borrow(&self, id: ClassId) -> bool {
        let node = self.node(id);
        node.state() == BucketState::CanBorrow
            && node
                .parent()
                .is_none_or(|p| self.can_send(p) || self.can_borrow(p))
    }

    /// Asks the ancestor chain whether traffic of `id` can be admitted now.
    ///
    /// This is a permission check only; tokens are spent by [`account`](Self::account).
    /// A class without a parent that is within its ceiling is granted from
    /// its own ceiling bucket.
    pub fn borrow(&self, id: ClassId) -> bool {
        if self.can_send(id) {
            return true;
        }
        if self.can_borrow(id) {
            return match self.node(id).parent() {
                Some(parent) => self.borrow(parent),
                None => true,
            };
        }
        false
    }

    /// Per-packet admission: replenishes `id` at `now`, then charges
    /// `amount` if the hierarchy can admit it.
    ///
    /// # Errors
    ///
    /// [`RateLimited`] with an estimate of how long until the chain can
    /// admit traffic again. Nothing is charged in that case.
    pub fn try_consume(
        &mut self,
        id: ClassId,
        amount: impl Into<NonZeroU32>,
        now: f64,
    ) -> Result<(), RateLimited> {
        let amount: NonZeroU32 = amount.into();
        self.replenish(id, now);
        if self.borrow(id) {
            self.account(id, amount.get() as f64);
            return Ok(());
        }
        Err(RateLimited {
            earliest_retry_after: self.retry_estimate(id),
        })
    }

    fn retry_estimate(&self, id: ClassId) -> Duration {
        let quantum = self.quantum;
        let mut wait = self
            .chain(id)
            .map(|node| node.time_to_tokens(quantum).min(node.time_to_ctokens(quantum)))
            .fold(0.0, f64::max);
        if wait <= 0.0 {
            // every bucket holds a quantum somewhere, the chain is blocked on
            // guaranteed tokens of an ancestor
            wait = self
                .chain(id)
                .map(|node| node.time_to_tokens(quantum))
                .fold(0.0, f64::max);
        }
        if wait <= 0.0 {
            wait = quantum / self.node(id).limit().ceil();
        }
        // a crawling rate can ask for more than a Duration holds
        Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX)
    }

    /// A point-in-time copy of every class for reporting.
    pub fn snapshot(&self) -> Vec<ClassSnapshot> {
        self.nodes()
            .map(|(id, node)| ClassSnapshot {
                id,
                name: node.name().to_owned(),
                parent: node.parent(),
                limit: *node.limit(),
                tokens: node.tokens(),
                ctokens: node.ctokens(),
                state: node.state(),
            })
            .collect()
    }
}

/// Iterator over the ancestors of a class, nearest first.
pub struct Ancestors<'a> {
    hierarchy: &'a Hierarchy,
    next: Option<ClassId>,
}

impl Iterator for Ancestors<'_> {
    type Item = ClassId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.hierarchy.node(id).parent();
        Some(id)
    }
}

/// Read-only view of one class, see [`Hierarchy::snapshot`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ClassSnapshot {
    pub id: ClassId,
    pub name: String,
    pub parent: Option<ClassId>,
    pub limit: ClassLimit,
    pub tokens: f64,
    pub ctokens: f64,
    pub state: BucketState,
}

fn default_quantum() -> f64 {
    DEFAULT_QUANTUM
}

/// Declarative description of a hierarchy, see [`Hierarchy::from_config`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HierarchyConfig {
    #[cfg_attr(feature = "serde", serde(default = "default_quantum"))]
    pub quantum: f64,
    pub classes: Vec<ClassConfig>,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            classes: Vec::new(),
        }
    }
}

/// One class of a [`HierarchyConfig`]. `ceil`, `burst` and `cburst` fall
/// back to `rate`, `rate` and `ceil` when omitted.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassConfig {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent: Option<String>,
    pub rate: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ceil: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub burst: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub cburst: Option<f64>,
}

impl ClassConfig {
    pub fn new(name: impl Into<String>, parent: Option<&str>, rate: f64, ceil: f64) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(str::to_owned),
            rate,
            ceil: Some(ceil),
            burst: None,
            cburst: None,
        }
    }

    fn limit(&self) -> Result<ClassLimit, ConfigError> {
        let mut limit = ClassLimit::new(self.rate, self.ceil.unwrap_or(self.rate))?;
        if let Some(burst) = self.burst {
            limit = limit.with_burst(burst)?;
        }
        if let Some(cburst) = self.cburst {
            limit = limit.with_cburst(cburst)?;
        }
        Ok(limit)
    }
}
