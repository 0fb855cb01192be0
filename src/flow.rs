//! Packets and the source/sink collaborators a [`Shaper`](crate::Shaper)
//! talks to.
//!
//! The scheduler only needs two narrow interfaces: something that hands out
//! the next packet ([`PacketSource`]) and something that accepts a packet
//! once it has been admitted ([`PacketSink`]). A few ready-made
//! implementations are provided for simulations and tests.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::atomic::AtomicF64;

/// A unit of traffic. Only its size is charged against the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Packet {
    size: NonZeroU32,
    created_at: f64,
}

impl Packet {
    /// A packet of `size` bytes produced at clock time `created_at`.
    pub fn new(size: impl Into<NonZeroU32>, created_at: f64) -> Self {
        Self {
            size: size.into(),
            created_at,
        }
    }

    pub fn size(&self) -> NonZeroU32 {
        self.size
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }
}

/// Produces packets for a shaper.
///
/// Called whenever the shaper's single slot is empty: once right after the
/// previous packet was forwarded and again at the start of every tick.
/// Returning `None` means nothing is available yet.
pub trait PacketSource: Send {
    fn next_packet(&mut self, now: f64) -> Option<Packet>;
}

/// Receives the packets a shaper forwards.
pub trait PacketSink: Send {
    fn deliver(&mut self, packet: Packet, now: f64);
}

/// A source that always has another packet ready.
#[derive(Debug, Clone)]
pub struct Backlogged {
    size: NonZeroU32,
    generated: u64,
}

impl Backlogged {
    pub fn new(size: impl Into<NonZeroU32>) -> Self {
        Self {
            size: size.into(),
            generated: 0,
        }
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }
}

impl PacketSource for Backlogged {
    fn next_packet(&mut self, now: f64) -> Option<Packet> {
        self.generated += 1;
        Some(Packet::new(self.size, now))
    }
}

/// A source releasing one packet every `interval` seconds, starting at
/// `start` and optionally stopping after `finish`.
///
/// Packets are stamped with the time they were due, not the time they were
/// picked up, so a shaper that lags behind shows up as delay.
#[derive(Debug, Clone)]
pub struct Paced {
    size: NonZeroU32,
    start: f64,
    interval: f64,
    finish: Option<f64>,
    released: u64,
}

impl Paced {
    pub fn new(size: impl Into<NonZeroU32>, start: f64, interval: f64) -> Self {
        Self {
            size: size.into(),
            start,
            interval,
            finish: None,
            released: 0,
        }
    }

    /// No packets are due after `finish`.
    pub fn until(mut self, finish: f64) -> Self {
        self.finish = Some(finish);
        self
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    fn next_due(&self) -> f64 {
        self.start + self.released as f64 * self.interval
    }
}

impl PacketSource for Paced {
    fn next_packet(&mut self, now: f64) -> Option<Packet> {
        let due = self.next_due();
        if due > now || self.finish.is_some_and(|finish| due > finish) {
            return None;
        }
        self.released += 1;
        Some(Packet::new(self.size, due))
    }
}

/// Adapts a closure into a [`PacketSource`], see [`source_fn`].
pub struct FnSource<F>(F);

/// Builds a [`PacketSource`] out of `f(now)`.
pub fn source_fn<F>(f: F) -> FnSource<F>
where
    F: FnMut(f64) -> Option<Packet> + Send,
{
    FnSource(f)
}

impl<F> PacketSource for FnSource<F>
where
    F: FnMut(f64) -> Option<Packet> + Send,
{
    fn next_packet(&mut self, now: f64) -> Option<Packet> {
        (self.0)(now)
    }
}

/// Adapts a closure into a [`PacketSink`], see [`sink_fn`].
pub struct FnSink<F>(F);

/// Builds a [`PacketSink`] out of `f(packet, now)`.
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: FnMut(Packet, f64) + Send,
{
    FnSink(f)
}

impl<F> PacketSink for FnSink<F>
where
    F: FnMut(Packet, f64) + Send,
{
    fn deliver(&mut self, packet: Packet, now: f64) {
        (self.0)(packet, now)
    }
}

/// Counters updated by a [`CountingSink`], shareable with whoever reports
/// on them.
#[derive(Debug)]
pub struct SinkCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    last_arrival: AtomicF64,
}

impl SinkCounters {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Clock time of the most recent delivery, zero before the first one.
    pub fn last_arrival(&self) -> f64 {
        self.last_arrival.load(Ordering::Relaxed)
    }

    /// Average bytes per second between time zero and the last arrival.
    pub fn rate(&self) -> f64 {
        let last = self.last_arrival();
        if last > 0.0 {
            self.bytes() as f64 / last
        } else {
            0.0
        }
    }
}

/// A sink that only counts what it receives.
#[derive(Debug, Clone)]
pub struct CountingSink {
    counters: Arc<SinkCounters>,
}

impl Default for CountingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingSink {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(SinkCounters {
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                last_arrival: AtomicF64::new(0.0),
            }),
        }
    }

    /// A handle that keeps reading the counters after the sink has been
    /// moved into a shaper.
    pub fn counters(&self) -> Arc<SinkCounters> {
        Arc::clone(&self.counters)
    }
}

impl PacketSink for CountingSink {
    fn deliver(&mut self, packet: Packet, now: f64) {
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(packet.size().get() as u64, Ordering::Relaxed);
        self.counters.last_arrival.store(now, Ordering::Relaxed);
    }
}

#[cfg(feature = "async")]
impl PacketSource for tokio::sync::mpsc::Receiver<Packet> {
    fn next_packet(&mut self, _now: f64) -> Option<Packet> {
        self.try_recv().ok()
    }
}

#[cfg(feature = "async")]
impl PacketSink for tokio::sync::mpsc::UnboundedSender<Packet> {
    fn deliver(&mut self, packet: Packet, _now: f64) {
        if self.send(packet).is_err() {
            tracing::trace!("receiver is gone, discarding delivered packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use nonzero_ext::nonzero;

    use super::*;

    #[test]
    fn paced_releases_on_schedule() {
        let mut src = Paced::new(nonzero!(100u32), 1.0, 0.5).until(2.0);
        assert!(src.next_packet(0.9).is_none());
        let p = src.next_packet(1.2).unwrap();
        assert_eq!(1.0, p.created_at());
        assert_eq!(100, p.size().get());
        // lagging behind: the backlog is released one call at a time
        assert_eq!(1.5, src.next_packet(2.5).unwrap().created_at());
        assert_eq!(2.0, src.next_packet(2.5).unwrap().created_at());
        // 2.5 is past the finish time
        assert!(src.next_packet(2.5).is_none());
        assert_eq!(3, src.released());
    }

    #[test]
    fn backlogged_never_runs_dry() {
        let mut src = Backlogged::new(nonzero!(64u32));
        for i in 0..10 {
            let p = src.next_packet(i as f64).unwrap();
            assert_eq!(i as f64, p.created_at());
        }
        assert_eq!(10, src.generated());
    }

    #[test]
    fn counting_sink_shares_counters() {
        let mut sink = CountingSink::new();
        let counters = sink.counters();
        assert_eq!(0.0, counters.rate());
        sink.deliver(Packet::new(nonzero!(100u32), 0.0), 1.0);
        sink.deliver(Packet::new(nonzero!(300u32), 0.0), 2.0);
        assert_eq!(2, counters.packets());
        assert_eq!(400, counters.bytes());
        assert_eq!(2.0, counters.last_arrival());
        assert_eq!(200.0, counters.rate());
    }

    #[test]
    fn closures_adapt() {
        let mut left = 2;
        let mut src = source_fn(move |now| {
            if left == 0 {
                return None;
            }
            left -= 1;
            Some(Packet::new(nonzero!(10u32), now))
        });
        assert!(src.next_packet(0.0).is_some());
        assert!(src.next_packet(0.0).is_some());
        assert!(src.next_packet(0.0).is_none());

        let mut seen = Vec::new();
        let mut sink = sink_fn(|p: Packet, now| seen.push((p.size().get(), now)));
        sink.deliver(Packet::new(nonzero!(10u32), 0.0), 3.0);
        drop(sink);
        assert_eq!(vec![(10, 3.0)], seen);
    }
}
