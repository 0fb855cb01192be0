//! Async adapters charging stream items to a shared [`Hierarchy`](crate::Hierarchy).
mod stream;

use std::num::NonZeroU32;

use futures::Stream;

pub use stream::{ShapedStream, SharedHierarchy};

use crate::{ClassId, Clock};

pub trait ShapedStreamExt: Stream + Sized {
    /// Charges every item, weighed by `weight_fn`, to `class`.
    fn shape<C, F>(
        self,
        hierarchy: SharedHierarchy,
        class: ClassId,
        clock: C,
        weight_fn: F,
    ) -> ShapedStream<Self, C, F>
    where
        C: Clock,
        F: Fn(&Self::Item) -> NonZeroU32;
}

impl<S: Stream> ShapedStreamExt for S {
    fn shape<C, F>(
        self,
        hierarchy: SharedHierarchy,
        class: ClassId,
        clock: C,
        weight_fn: F,
    ) -> ShapedStream<Self, C, F>
    where
        C: Clock,
        F: Fn(&Self::Item) -> NonZeroU32,
    {
        ShapedStream::new(self, hierarchy, class, clock, weight_fn)
    }
}
