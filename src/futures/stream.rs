use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};

use futures::Stream;
use pin_project_lite::pin_project;
#[cfg(feature = "tokio-hrtime")]
use tokio_hrtime::{Sleep, sleep};
#[cfg(not(feature = "tokio-hrtime"))]
use tokio::time::{Sleep, sleep};
use tracing::trace;

use crate::bucket::ClassId;
use crate::clock::Clock;
use crate::hierarchy::Hierarchy;

/// A hierarchy shared between every stream charged against it.
pub type SharedHierarchy = Arc<Mutex<Hierarchy>>;

pin_project! {
    /// A stream whose items are charged to a leaf class of a shared
    /// hierarchy.
    ///
    /// Each item is weighed with `weight_fn` and admitted through
    /// [`Hierarchy::try_consume`]. An item that is refused is held back and
    /// retried after the suggested delay, so items come out in order and
    /// never faster than the class and its ancestors allow.
    ///
    /// # Panics
    ///
    /// Polling panics if `class` does not belong to the hierarchy.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use htbucket::futures::{ShapedStream, SharedHierarchy};
    /// use htbucket::{ClassLimit, Hierarchy, TokioClock};
    /// use futures::stream;
    /// use std::num::NonZeroU32;
    /// use std::sync::{Arc, Mutex};
    ///
    /// let mut htb = Hierarchy::new();
    /// let uplink = ClassLimit::new(1000.0, 1000.0).unwrap();
    /// let root = htb.add_root("uplink", uplink).unwrap();
    /// let video = ClassLimit::new(600.0, 1000.0).unwrap();
    /// let video = htb.add_child(root, "video", video).unwrap();
    /// let htb: SharedHierarchy = Arc::new(Mutex::new(htb));
    ///
    /// let frames = stream::iter(vec![vec![0u8; 400], vec![0u8; 700]]);
    /// let weight = |frame: &Vec<u8>| {
    ///     NonZeroU32::new(frame.len() as u32).unwrap_or(NonZeroU32::MIN)
    /// };
    /// let shaped = ShapedStream::new(frames, htb, video, TokioClock::default(), weight);
    /// ```
    pub struct ShapedStream<S, C, F>
    where
        S: Stream,
    {
        #[pin]
        stream: S,
        hierarchy: SharedHierarchy,
        class: ClassId,
        clock: C,
        weight_fn: F,
        #[pin]
        delay: Option<Sleep>,
        pending_item: Option<S::Item>,
    }
}

impl<S, C, F> ShapedStream<S, C, F>
where
    S: Stream,
    C: Clock,
    F: Fn(&S::Item) -> NonZeroU32,
{
    pub fn new(
        stream: S,
        hierarchy: SharedHierarchy,
        class: ClassId,
        clock: C,
        weight_fn: F,
    ) -> Self {
        Self {
            stream,
            hierarchy,
            class,
            clock,
            weight_fn,
            delay: None,
            pending_item: None,
        }
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn hierarchy(&self) -> &SharedHierarchy {
        &self.hierarchy
    }

    /// Whether an item has been pulled from the inner stream but not yet
    /// admitted.
    pub fn is_holding(&self) -> bool {
        self.pending_item.is_some()
    }
}

impl<S, C, F> Stream for ShapedStream<S, C, F>
where
    S: Stream,
    C: Clock,
    F: Fn(&S::Item) -> NonZeroU32,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(delay) = this.delay.as_mut().as_pin_mut() {
                ready!(delay.poll(cx));
                this.delay.set(None);
            }

            let item = match this.pending_item.take() {
                Some(item) => item,
                None => match ready!(this.stream.as_mut().poll_next(cx)) {
                    Some(item) => item,
                    None => return Poll::Ready(None),
                },
            };

            let weight = (this.weight_fn)(&item);
            let admitted = this
                .hierarchy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_consume(*this.class, weight, this.clock.now());
            match admitted {
                Ok(()) => return Poll::Ready(Some(item)),
                Err(limited) => {
                    let nap = limited.earliest_retry_after();
                    trace!(class = %this.class, weight = weight.get(), ?nap, "holding item");
                    *this.pending_item = Some(item);
                    this.delay.set(Some(sleep(nap)));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let held = usize::from(self.pending_item.is_some());
        let (lower, upper) = self.stream.size_hint();
        (
            lower.saturating_add(held),
            upper.and_then(|u| u.checked_add(held)),
        )
    }
}

#[cfg(all(test, not(feature = "tokio-hrtime")))]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use nonzero_ext::nonzero;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::clock::TokioClock;
    use crate::limit::ClassLimit;

    fn shared(htb: Hierarchy) -> SharedHierarchy {
        Arc::new(Mutex::new(htb))
    }

    #[tokio::test(start_paused = true)]
    async fn paces_items_at_class_rate() {
        let mut htb = Hierarchy::new();
        let class = htb
            .add_root("leaf", ClassLimit::new(100.0, 100.0).unwrap())
            .unwrap();
        let start = tokio::time::Instant::now();
        let stream = stream::iter(vec![1, 2, 3, 4, 5]);
        let mut shaped = std::pin::pin!(ShapedStream::new(
            stream,
            shared(htb),
            class,
            TokioClock::default(),
            |_| nonzero!(100u32)
        ));

        let mut results = vec![];
        while let Some(item) = shaped.next().await {
            results.push(item);
        }

        assert_eq!(results, vec![1, 2, 3, 4, 5]);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_class_does_not_delay() {
        let mut htb = Hierarchy::new();
        let class = htb
            .add_root("wide", ClassLimit::new(100_000.0, 100_000.0).unwrap())
            .unwrap();
        let start = tokio::time::Instant::now();
        let mut shaped = std::pin::pin!(ShapedStream::new(
            stream::iter(0..50),
            shared(htb),
            class,
            TokioClock::default(),
            |_| nonzero!(100u32)
        ));

        let mut count = 0;
        while shaped.next().await.is_some() {
            count += 1;
        }
        assert_eq!(50, count);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn siblings_share_the_parent_ceiling() {
        let mut htb = Hierarchy::new();
        let root = htb
            .add_root("root", ClassLimit::new(100.0, 100.0).unwrap())
            .unwrap();
        let a = htb
            .add_child(root, "a", ClassLimit::new(50.0, 100.0).unwrap())
            .unwrap();
        let b = htb
            .add_child(root, "b", ClassLimit::new(50.0, 100.0).unwrap())
            .unwrap();
        let htb = shared(htb);
        let clock = TokioClock::default();
        let start = tokio::time::Instant::now();

        let drain = |class| {
            let shaped = ShapedStream::new(
                stream::iter(0..5),
                Arc::clone(&htb),
                class,
                clock.clone(),
                |_| nonzero!(100u32),
            );
            async move {
                let mut shaped = std::pin::pin!(shaped);
                let mut n = 0;
                while shaped.next().await.is_some() {
                    n += 1;
                }
                n
            }
        };
        let (na, nb) = tokio::join!(drain(a), drain(b));

        assert_eq!((5, 5), (na, nb));
        // ten items of a full quantum each, through a root refilling one
        // quantum per second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(12), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn crawling_class_waits_instead_of_panicking() {
        let mut htb = Hierarchy::new();
        let class = htb
            .add_root("crawl", ClassLimit::new(1e-18, 1e-18).unwrap())
            .unwrap();
        let mut shaped = std::pin::pin!(ShapedStream::new(
            stream::iter(vec![1]),
            shared(htb),
            class,
            TokioClock::default(),
            |_| nonzero!(100u32)
        ));
        let next = tokio::time::timeout(Duration::from_secs(5), shaped.next()).await;
        assert!(next.is_err());
        assert!(shaped.is_holding());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_ends_immediately() {
        let mut htb = Hierarchy::new();
        let class = htb
            .add_root("leaf", ClassLimit::new(1.0, 1.0).unwrap())
            .unwrap();
        let mut shaped = std::pin::pin!(ShapedStream::new(
            stream::iter(Vec::<u32>::new()),
            shared(htb),
            class,
            TokioClock::default(),
            |_| nonzero!(1u32)
        ));
        assert_eq!(None, shaped.next().await);
        assert!(!shaped.is_holding());
    }
}
