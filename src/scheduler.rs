use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::bucket::ClassId;
use crate::error::ConfigError;
use crate::flow::{PacketSink, PacketSource};
use crate::hierarchy::Hierarchy;
use crate::limit::ClassLimit;
use crate::shaper::{Dispatch, OverdraftPolicy, Shaper, ShaperStats};

/// Knobs of the dispatch loop.
///
/// # Examples
///
/// ```rust
/// use htbucket::{OverdraftPolicy, SchedulerConfig};
/// use std::time::Duration;
///
/// let config = SchedulerConfig::default()
///     .with_tick_interval(Duration::from_millis(50))
///     .with_overdraft(OverdraftPolicy::Hold)
///     .with_max_dwell(Duration::from_secs(2))
///     .with_seed(7);
/// assert_eq!(Duration::from_millis(50), config.tick_interval);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    /// Time between two ticks. Defaults to 100ms.
    pub tick_interval: Duration,
    /// Handling of packets larger than the remaining capacity.
    pub overdraft: OverdraftPolicy,
    /// Longest a packet may wait in a shaper before it is dropped.
    /// Unlimited by default.
    pub max_dwell: Option<Duration>,
    /// Seed of the service order shuffle; drawn from the OS when unset.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            overdraft: OverdraftPolicy::default(),
            max_dwell: None,
            seed: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_overdraft(mut self, overdraft: OverdraftPolicy) -> Self {
        self.overdraft = overdraft;
        self
    }

    pub fn with_max_dwell(mut self, max_dwell: Duration) -> Self {
        self.max_dwell = Some(max_dwell);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Index of a shaper registered with a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaperId(usize);

/// What happened during one or more ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TickReport {
    pub packets_guaranteed: u64,
    pub bytes_guaranteed: u64,
    pub packets_borrowed: u64,
    pub bytes_borrowed: u64,
    pub packets_dropped: u64,
}

impl TickReport {
    pub fn packets_sent(&self) -> u64 {
        self.packets_guaranteed + self.packets_borrowed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_guaranteed + self.bytes_borrowed
    }

    pub fn merge(&mut self, other: TickReport) {
        self.packets_guaranteed += other.packets_guaranteed;
        self.bytes_guaranteed += other.bytes_guaranteed;
        self.packets_borrowed += other.packets_borrowed;
        self.bytes_borrowed += other.bytes_borrowed;
        self.packets_dropped += other.packets_dropped;
    }
}

/// Owns a hierarchy and the shapers feeding it, and drives both.
///
/// Every tick first tops up the buckets, then serves every shaper that can
/// send on its guaranteed rate until it cannot anymore, and only then lets
/// shapers borrow from their ancestors. Within each phase the service order
/// is shuffled, so siblings in the same state get the same long-run chance
/// to go first.
///
/// # Examples
///
/// ```rust
/// use htbucket::{Backlogged, ClassLimit, CountingSink, Hierarchy, Scheduler, SchedulerConfig};
/// use std::num::NonZeroU32;
///
/// let mut htb = Hierarchy::new();
/// let root = htb.add_root("root", ClassLimit::new(800.0, 800.0).unwrap()).unwrap();
/// let mut scheduler = Scheduler::new(htb, SchedulerConfig::default().with_seed(1)).unwrap();
///
/// let sink = CountingSink::new();
/// let received = sink.counters();
/// let size = NonZeroU32::new(100).unwrap();
/// let bulk = ClassLimit::new(300.0, 800.0).unwrap();
/// scheduler
///     .add_shaper(Some(root), "bulk", bulk, Backlogged::new(size), sink)
///     .unwrap();
///
/// scheduler.simulate(60.0);
/// // never more than the root's ceiling, plus the initial burst
/// assert!(received.bytes() as f64 <= 800.0 * 60.0 + 800.0);
/// ```
pub struct Scheduler {
    hierarchy: Hierarchy,
    shapers: Vec<Shaper>,
    order: Vec<usize>,
    rng: StdRng,
    config: SchedulerConfig,
    simulated_ticks: u64,
}

impl Scheduler {
    /// # Errors
    ///
    /// [`ConfigError::NotPositive`] for a zero tick interval or max dwell.
    pub fn new(hierarchy: Hierarchy, config: SchedulerConfig) -> Result<Self, ConfigError> {
        if config.tick_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "tick_interval",
                value: 0.0,
            });
        }
        if config.max_dwell.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::NotPositive {
                field: "max_dwell",
                value: 0.0,
            });
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            hierarchy,
            shapers: Vec::new(),
            order: Vec::new(),
            rng,
            config,
            simulated_ticks: 0,
        })
    }

    /// Registers a shaper for a class that already exists in the hierarchy.
    ///
    /// # Errors
    ///
    /// The class must exist, must be a leaf, and must not be bound to
    /// another shaper.
    pub fn register(&mut self, shaper: Shaper) -> Result<ShaperId, ConfigError> {
        let class = shaper.class();
        let node = self
            .hierarchy
            .get(class)
            .ok_or(ConfigError::UnknownClass(class))?;
        if !node.is_leaf() {
            return Err(ConfigError::NotALeaf(class));
        }
        if self.is_bound(class) {
            return Err(ConfigError::AlreadyBound(class));
        }
        debug!(class = %class, name = node.name(), "registered shaper");
        let id = ShaperId(self.shapers.len());
        self.order.push(id.0);
        self.shapers.push(shaper);
        Ok(id)
    }

    /// Creates a leaf class below `parent` (or a new root) and registers a
    /// shaper for it.
    pub fn add_shaper(
        &mut self,
        parent: Option<ClassId>,
        name: impl Into<String>,
        limit: ClassLimit,
        source: impl PacketSource + 'static,
        sink: impl PacketSink + 'static,
    ) -> Result<ShaperId, ConfigError> {
        let class = match parent {
            Some(parent) if self.is_bound(parent) => {
                return Err(ConfigError::ParentIsShaper(parent));
            }
            Some(parent) => self.hierarchy.add_child(parent, name, limit)?,
            None => self.hierarchy.add_root(name, limit)?,
        };
        self.register(Shaper::new(class, source, sink))
    }

    fn is_bound(&self, class: ClassId) -> bool {
        self.shapers.iter().any(|s| s.class() == class)
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn shaper(&self, id: ShaperId) -> &Shaper {
        &self.shapers[id.0]
    }

    pub fn shapers(&self) -> &[Shaper] {
        &self.shapers
    }

    /// Mutable access to a shaper, e.g. to swap its source or sink.
    pub fn shaper_mut(&mut self, id: ShaperId) -> &mut Shaper {
        &mut self.shapers[id.0]
    }

    /// Counters of every shaper, in registration order.
    pub fn stats(&self) -> Vec<ShaperStats> {
        self.shapers
            .iter()
            .map(|s| s.stats(&self.hierarchy))
            .collect()
    }

    /// Runs one replenish + guaranteed + borrow cycle at time `now`.
    pub fn tick(&mut self, now: f64) -> TickReport {
        let mut report = TickReport::default();
        let policy = self.config.overdraft;

        let max_dwell = self.config.max_dwell.map(|d| d.as_secs_f64());
        for shaper in &mut self.shapers {
            if max_dwell.is_some_and(|max| shaper.expire(now, max)) {
                report.packets_dropped += 1;
            }
            shaper.fetch(now);
        }

        for shaper in &self.shapers {
            self.hierarchy.replenish(shaper.class(), now);
        }

        self.order.shuffle(&mut self.rng);
        for &idx in &self.order {
            let shaper = &mut self.shapers[idx];
            while shaper.has_pending_packet() && self.hierarchy.can_send(shaper.class()) {
                match shaper.send(&mut self.hierarchy, now, policy) {
                    Dispatch::Sent { bytes } => {
                        report.packets_guaranteed += 1;
                        report.bytes_guaranteed += bytes as u64;
                    }
                    Dispatch::Dropped => {
                        report.packets_dropped += 1;
                        break;
                    }
                    Dispatch::Held | Dispatch::Refused | Dispatch::Empty => break,
                }
            }
        }

        self.order.shuffle(&mut self.rng);
        for &idx in &self.order {
            let shaper = &mut self.shapers[idx];
            while shaper.has_pending_packet() && self.hierarchy.can_borrow(shaper.class()) {
                match shaper.borrow_and_send(&mut self.hierarchy, now, policy) {
                    Dispatch::Sent { bytes } => {
                        report.packets_borrowed += 1;
                        report.bytes_borrowed += bytes as u64;
                    }
                    Dispatch::Dropped => {
                        report.packets_dropped += 1;
                        break;
                    }
                    Dispatch::Held | Dispatch::Refused | Dispatch::Empty => break,
                }
            }
        }

        debug!(
            now,
            guaranteed = report.packets_guaranteed,
            borrowed = report.packets_borrowed,
            dropped = report.packets_dropped,
            "tick"
        );
        report
    }

    /// Ticks on simulated time, at every multiple of the tick interval up to
    /// and including `until`. Consecutive calls continue where the previous
    /// one stopped.
    pub fn simulate(&mut self, until: f64) -> TickReport {
        let interval = self.config.tick_interval.as_secs_f64();
        let mut total = TickReport::default();
        loop {
            let now = self.simulated_ticks as f64 * interval;
            if now > until {
                break;
            }
            total.merge(self.tick(now));
            self.simulated_ticks += 1;
        }
        total
    }

    /// Ticks on a tokio interval, stamping each tick with `clock`, until
    /// `shutdown` resolves.
    #[cfg(feature = "async")]
    pub async fn run<C: crate::Clock>(
        &mut self,
        clock: C,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> TickReport {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        let mut total = TickReport::default();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => total.merge(self.tick(clock.now())),
            }
        }
        debug!(
            packets = total.packets_sent(),
            bytes = total.bytes_sent(),
            dropped = total.packets_dropped,
            "scheduler stopped"
        );
        total
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("hierarchy", &self.hierarchy)
            .field("shapers", &self.shapers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
