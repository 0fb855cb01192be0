#![doc = include_str!("../README.md")]
//!
//! # Core Components
//!
//! - [`Hierarchy`] - The tree of token buckets, with replenishment, accounting and borrowing
//! - [`ClassLimit`] - Guaranteed rate, ceiling rate and the two burst sizes of a class
//! - [`Shaper`] - Binds one flow to a leaf class
//! - [`Scheduler`] - The two-phase dispatch loop driving every shaper
//! - [`Clock`] trait and implementations for time sources
//!
//! # Quick Start
//!
//! ```rust
//! use std::num::NonZeroU32;
//!
//! use htbucket::{ClassLimit, Hierarchy};
//!
//! // 1000 bytes per second for the link, 300 guaranteed to ssh
//! let mut htb = Hierarchy::new();
//! let link = htb.add_root("link", ClassLimit::new(1000.0, 1000.0).unwrap()).unwrap();
//! let ssh = htb.add_child(link, "ssh", ClassLimit::new(300.0, 1000.0).unwrap()).unwrap();
//!
//! let packet = NonZeroU32::new(100).unwrap();
//! match htb.try_consume(ssh, packet, 0.0) {
//!     Ok(()) => println!("forward it"),
//!     Err(limited) => println!("retry in {:?}", limited.earliest_retry_after()),
//! }
//! ```

mod atomic;
mod bucket;
mod clock;
mod error;
mod flow;
#[cfg(feature = "async")]
pub mod futures;
mod hierarchy;
mod limit;
mod scheduler;
mod shaper;

pub use bucket::{BucketNode, BucketState, ClassId};
#[cfg(feature = "tokio")]
pub use clock::TokioClock;
pub use clock::{Clock, ManualClock, StdClock};
#[cfg(feature = "quanta")]
pub use clock::{FastClock, QuantaClock};
pub use error::*;
pub use flow::{
    Backlogged, CountingSink, FnSink, FnSource, Packet, PacketSink, PacketSource, Paced,
    SinkCounters, sink_fn, source_fn,
};
#[cfg(feature = "async")]
pub use futures::ShapedStreamExt;
pub use hierarchy::{
    Ancestors, ClassConfig, ClassSnapshot, DEFAULT_QUANTUM, Hierarchy, HierarchyConfig,
};
pub use limit::ClassLimit;
pub use scheduler::{Scheduler, SchedulerConfig, ShaperId, TickReport};
pub use shaper::{Dispatch, OverdraftPolicy, Shaper, ShaperStats};
