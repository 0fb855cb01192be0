use tracing::{debug, trace, warn};

use crate::bucket::ClassId;
use crate::flow::{Packet, PacketSink, PacketSource};
use crate::hierarchy::Hierarchy;

/// What to do with a packet larger than what some class on its chain has
/// left in both of its buckets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OverdraftPolicy {
    /// Send it anyway; the over-charge is clamped at zero and logged.
    #[default]
    Admit,
    /// Keep it in the slot until the chain has recovered enough capacity.
    /// A packet that would not fit even into full buckets is dropped.
    Hold,
    /// Discard it and count it as dropped.
    Drop,
}

/// Outcome of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The packet was charged and forwarded.
    Sent { bytes: u32 },
    /// The overdraft policy kept the packet pending.
    Held,
    /// The overdraft policy discarded the packet.
    Dropped,
    /// No ancestor granted borrowing.
    Refused,
    /// There was no pending packet.
    Empty,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    packet: Packet,
    since: f64,
}

/// Binds a leaf class to one flow.
///
/// A shaper holds at most one packet at a time and only asks its source for
/// the next one after the current one was forwarded (or dropped), so the
/// source sees back-pressure directly.
pub struct Shaper {
    class: ClassId,
    source: Box<dyn PacketSource>,
    sink: Box<dyn PacketSink>,
    pending: Option<Pending>,
    packets_sent: u64,
    bytes_sent: u64,
    packets_dropped: u64,
}

impl Shaper {
    pub fn new(
        class: ClassId,
        source: impl PacketSource + 'static,
        sink: impl PacketSink + 'static,
    ) -> Self {
        Self {
            class,
            source: Box::new(source),
            sink: Box::new(sink),
            pending: None,
            packets_sent: 0,
            bytes_sent: 0,
            packets_dropped: 0,
        }
    }

    /// Replaces the source. A packet already pending is kept.
    pub fn attach_source(&mut self, source: impl PacketSource + 'static) {
        self.source = Box::new(source);
    }

    pub fn attach_sink(&mut self, sink: impl PacketSink + 'static) {
        self.sink = Box::new(sink);
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn has_pending_packet(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_packet(&self) -> Option<&Packet> {
        self.pending.as_ref().map(|p| &p.packet)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Pulls the next packet from the source if the slot is empty.
    pub fn fetch(&mut self, now: f64) {
        if self.pending.is_none() {
            self.pending = self
                .source
                .next_packet(now)
                .map(|packet| Pending { packet, since: now });
        }
    }

    /// Drops the pending packet if it has been waiting for longer than
    /// `max_dwell` seconds. Returns whether a packet was dropped.
    pub fn expire(&mut self, now: f64, max_dwell: f64) -> bool {
        match self.pending {
            Some(pending) if now - pending.since > max_dwell => {
                debug!(
                    class = %self.class,
                    waited = now - pending.since,
                    "dropping packet that outstayed its dwell time"
                );
                self.pending = None;
                self.packets_dropped += 1;
                true
            }
            _ => false,
        }
    }

    /// Charges the pending packet to the class chain, forwards it, and
    /// fetches the next one.
    ///
    /// Does not check eligibility; callers are expected to have asked
    /// [`Hierarchy::can_send`] or obtained a grant first.
    pub fn send(
        &mut self,
        hierarchy: &mut Hierarchy,
        now: f64,
        policy: OverdraftPolicy,
    ) -> Dispatch {
        let Some(pending) = self.pending.take() else {
            return Dispatch::Empty;
        };
        let bytes = pending.packet.size().get();
        if hierarchy.would_exceed(self.class, bytes as f64) {
            match policy {
                OverdraftPolicy::Admit => {}
                OverdraftPolicy::Hold if hierarchy.exceeds_capacity(self.class, bytes as f64) => {
                    warn!(
                        class = %self.class,
                        bytes,
                        "dropping packet that no amount of waiting would make room for"
                    );
                    self.packets_dropped += 1;
                    return Dispatch::Dropped;
                }
                OverdraftPolicy::Hold => {
                    trace!(
                        class = %self.class,
                        bytes,
                        "holding packet larger than remaining capacity"
                    );
                    self.pending = Some(pending);
                    return Dispatch::Held;
                }
                OverdraftPolicy::Drop => {
                    debug!(
                        class = %self.class,
                        bytes,
                        "dropping packet larger than remaining capacity"
                    );
                    self.packets_dropped += 1;
                    return Dispatch::Dropped;
                }
            }
        }
        hierarchy.account(self.class, bytes as f64);
        self.sink.deliver(pending.packet, now);
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        trace!(class = %self.class, bytes, "sent");
        self.fetch(now);
        Dispatch::Sent { bytes }
    }

    /// Asks the ancestors for a grant and sends on success.
    ///
    /// A shaper whose class has no parent is granted from its own ceiling.
    pub fn borrow_and_send(
        &mut self,
        hierarchy: &mut Hierarchy,
        now: f64,
        policy: OverdraftPolicy,
    ) -> Dispatch {
        let granted = match hierarchy.node(self.class).parent() {
            Some(parent) => hierarchy.borrow(parent),
            None => hierarchy.borrow(self.class),
        };
        if !granted {
            return Dispatch::Refused;
        }
        self.send(hierarchy, now, policy)
    }

    pub fn stats(&self, hierarchy: &Hierarchy) -> ShaperStats {
        let node = hierarchy.node(self.class);
        ShaperStats {
            class: self.class,
            name: node.name().to_owned(),
            rate: node.limit().rate(),
            ceil: node.limit().ceil(),
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_dropped: self.packets_dropped,
        }
    }
}

impl std::fmt::Debug for Shaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shaper")
            .field("class", &self.class)
            .field("pending", &self.pending)
            .field("packets_sent", &self.packets_sent)
            .field("bytes_sent", &self.bytes_sent)
            .field("packets_dropped", &self.packets_dropped)
            .finish_non_exhaustive()
    }
}

/// Read-only counters of one shaper.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ShaperStats {
    pub class: ClassId,
    pub name: String,
    pub rate: f64,
    pub ceil: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
}

impl ShaperStats {
    /// Average throughput over `elapsed` seconds.
    pub fn bytes_per_second(&self, elapsed: f64) -> f64 {
        if elapsed > 0.0 {
            self.bytes_sent as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for ShaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} packets, {} bytes, {} dropped",
            self.name, self.packets_sent, self.bytes_sent, self.packets_dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use nonzero_ext::nonzero;

    use super::*;
    use crate::flow::{Backlogged, CountingSink, Paced, sink_fn};
    use crate::{BucketState, ClassLimit};

    fn tree() -> (Hierarchy, ClassId, ClassId) {
        let mut htb = Hierarchy::new();
        let root = htb
            .add_root("root", ClassLimit::new(400.0, 400.0).unwrap())
            .unwrap();
        let leaf = htb
            .add_child(root, "leaf", ClassLimit::new(200.0, 400.0).unwrap())
            .unwrap();
        (htb, root, leaf)
    }

    #[test]
    fn send_charges_forwards_and_refetches() {
        let (mut htb, root, leaf) = tree();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let delivered = Arc::clone(&delivered);
            sink_fn(move |p: Packet, now| delivered.lock().unwrap().push((p.size().get(), now)))
        };
        let mut shaper = Shaper::new(leaf, Backlogged::new(nonzero!(100u32)), sink);
        assert!(!shaper.has_pending_packet());
        assert_eq!(Dispatch::Empty, shaper.send(&mut htb, 0.0, OverdraftPolicy::Admit));

        shaper.fetch(0.0);
        assert!(shaper.has_pending_packet());
        assert_eq!(
            Dispatch::Sent { bytes: 100 },
            shaper.send(&mut htb, 0.0, OverdraftPolicy::Admit)
        );
        // the next packet is already waiting
        assert!(shaper.has_pending_packet());
        assert_eq!(1, shaper.packets_sent());
        assert_eq!(100, shaper.bytes_sent());
        assert_eq!(100.0, htb.node(leaf).tokens());
        assert_eq!(300.0, htb.node(root).tokens());
        assert_eq!(vec![(100, 0.0)], *delivered.lock().unwrap());
    }

    #[test]
    fn borrow_and_send_goes_through_the_parent() {
        let (mut htb, root, leaf) = tree();
        let mut shaper = Shaper::new(leaf, Backlogged::new(nonzero!(100u32)), CountingSink::new());
        shaper.fetch(0.0);
        htb.account(leaf, 200.0);
        assert_eq!(BucketState::CanBorrow, htb.state(leaf));
        assert_eq!(
            Dispatch::Sent { bytes: 100 },
            shaper.borrow_and_send(&mut htb, 0.0, OverdraftPolicy::Admit)
        );
        assert_eq!(100.0, htb.node(root).tokens());

        htb.account(root, 100.0);
        assert_eq!(BucketState::CannotSend, htb.state(root));
        assert_eq!(
            Dispatch::Refused,
            shaper.borrow_and_send(&mut htb, 0.0, OverdraftPolicy::Admit)
        );
        assert!(shaper.has_pending_packet());
    }

    #[test]
    fn overdraft_policies() {
        let oversized = || Backlogged::new(nonzero!(300u32));

        let (mut htb, root, leaf) = tree();
        htb.account(leaf, 200.0);
        let mut shaper = Shaper::new(leaf, oversized(), CountingSink::new());
        shaper.fetch(0.0);
        assert_eq!(Dispatch::Held, shaper.send(&mut htb, 0.0, OverdraftPolicy::Hold));
        assert!(shaper.has_pending_packet());
        assert_eq!(200.0, htb.node(root).tokens());

        assert_eq!(Dispatch::Dropped, shaper.send(&mut htb, 0.0, OverdraftPolicy::Drop));
        assert!(!shaper.has_pending_packet());
        assert_eq!(1, shaper.packets_dropped());
        assert_eq!(200.0, htb.node(root).tokens());

        shaper.fetch(0.0);
        assert_eq!(
            Dispatch::Sent { bytes: 300 },
            shaper.send(&mut htb, 0.0, OverdraftPolicy::Admit)
        );
        assert_eq!(0.0, htb.node(root).tokens());
        assert_eq!(0.0, htb.node(root).ctokens());
        assert_eq!(0.0, htb.node(leaf).tokens());
    }

    #[test]
    fn hold_gives_up_on_packets_beyond_capacity() {
        let (mut htb, root, leaf) = tree();
        // both buckets of every class are full and still too small
        let mut shaper = Shaper::new(leaf, Backlogged::new(nonzero!(500u32)), CountingSink::new());
        shaper.fetch(0.0);
        assert_eq!(Dispatch::Dropped, shaper.send(&mut htb, 0.0, OverdraftPolicy::Hold));
        assert!(!shaper.has_pending_packet());
        assert_eq!(1, shaper.packets_dropped());
        assert_eq!(0, shaper.packets_sent());
        assert_eq!(400.0, htb.node(root).tokens());
        assert_eq!(200.0, htb.node(leaf).tokens());
    }

    #[test]
    fn expire_enforces_dwell_time() {
        let (_, _, leaf) = tree();
        let mut shaper = Shaper::new(
            leaf,
            Paced::new(nonzero!(100u32), 0.0, 10.0),
            CountingSink::new(),
        );
        shaper.fetch(0.0);
        assert!(!shaper.expire(0.5, 0.5));
        assert!(shaper.expire(0.6, 0.5));
        assert!(!shaper.has_pending_packet());
        assert_eq!(1, shaper.packets_dropped());
        assert!(!shaper.expire(0.7, 0.5));
    }

    #[test]
    fn stats_report_class_and_counters() {
        let (mut htb, _, leaf) = tree();
        let mut shaper = Shaper::new(leaf, Backlogged::new(nonzero!(50u32)), CountingSink::new());
        shaper.fetch(0.0);
        shaper.send(&mut htb, 0.0, OverdraftPolicy::Admit);
        shaper.send(&mut htb, 0.0, OverdraftPolicy::Admit);
        let stats = shaper.stats(&htb);
        assert_eq!("leaf", stats.name);
        assert_eq!(200.0, stats.rate);
        assert_eq!(400.0, stats.ceil);
        assert_eq!(2, stats.packets_sent);
        assert_eq!(100, stats.bytes_sent);
        assert_eq!(50.0, stats.bytes_per_second(2.0));
        assert_eq!(0.0, stats.bytes_per_second(0.0));
        assert_eq!("leaf: 2 packets, 100 bytes, 0 dropped", stats.to_string());
    }
}
