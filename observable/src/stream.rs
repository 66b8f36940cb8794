//! Cancellable multi-subscriber streams.
//!
//! A [`StreamFactory`] hands out independent [`Subscription`]s. Each one is backed by a
//! [`Continuation`] that the producer registers somewhere (usually a
//! [`Broadcast`](crate::broadcast::Broadcast)), and by a [`Registration`] guard that the
//! subscription owns. Dropping the subscription drops the guard, which deregisters the
//! continuation, so consumers never need to unsubscribe by hand: breaking out of a
//! `while let Some(v) = sub.next().await` loop, aborting the task that polls it, or
//! just letting it go out of scope all clean up.
//!
//! A subscription is one-shot. Once it has yielded `None` it stays finished.

use futures::stream::{FusedStream, Stream};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::trace;

use crate::broadcast::{Delivery, IntoListener, Listener};

/// How many not-yet-consumed values a subscription may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferingPolicy {
    /// Queue everything until consumed
    #[default]
    Unbounded,
    /// Keep the oldest `n` unconsumed values; newer arrivals are dropped
    BufferingOldest(usize),
    /// Keep the newest `n` unconsumed values; the oldest is evicted to make room
    BufferingNewest(usize),
}

impl BufferingPolicy {
    pub fn oldest(limit: usize) -> Self { BufferingPolicy::BufferingOldest(limit) }
    pub fn newest(limit: usize) -> Self { BufferingPolicy::BufferingNewest(limit) }
}

/// Outcome of [`Continuation::yield_value`]
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// Queued. `remaining` is the free buffer space left, `None` when unbounded.
    Enqueued { remaining: Option<usize> },
    /// The buffer was full; carries the value that was discarded. Under
    /// `BufferingNewest` that is the evicted oldest value, otherwise the new one.
    Dropped(T),
    /// The subscription has finished and will never yield again
    Terminated,
}

struct Shared<T> {
    policy: BufferingPolicy,
    state: Mutex<State<T>>,
}

struct State<T> {
    buffer: VecDeque<T>,
    finished: bool,
    // Some only while the consumer is parked waiting for a value
    waker: Option<Waker>,
}

impl<T> Shared<T> {
    fn new(policy: BufferingPolicy) -> Arc<Self> {
        Arc::new(Self { policy, state: Mutex::new(State { buffer: VecDeque::new(), finished: false, waker: None }) })
    }

    fn finish(&self, discard: bool) {
        let waker = {
            let mut state = self.state.lock();
            state.finished = true;
            if discard {
                state.buffer.clear();
            }
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The producer half of a subscription.
///
/// Dropping the continuation finishes the subscription: the consumer drains whatever is
/// buffered and then sees the end of the stream.
pub struct Continuation<T>(Arc<Shared<T>>);

impl<T> Continuation<T> {
    /// Hand a value to the consumer, applying the buffering policy
    pub fn yield_value(&self, value: T) -> YieldResult<T> {
        let (result, waker) = {
            let mut state = self.0.state.lock();
            if state.finished {
                return YieldResult::Terminated;
            }
            // a consumer that is already parked can always take one value directly
            let awaiting = state.waker.is_some();
            let capacity = |limit: usize| if awaiting { limit.max(1) } else { limit };
            let result = match self.0.policy {
                BufferingPolicy::Unbounded => {
                    state.buffer.push_back(value);
                    YieldResult::Enqueued { remaining: None }
                }
                BufferingPolicy::BufferingOldest(limit) => {
                    let capacity = capacity(limit);
                    if state.buffer.len() >= capacity {
                        YieldResult::Dropped(value)
                    } else {
                        state.buffer.push_back(value);
                        YieldResult::Enqueued { remaining: Some(capacity - state.buffer.len()) }
                    }
                }
                BufferingPolicy::BufferingNewest(limit) => {
                    let capacity = capacity(limit);
                    if capacity == 0 {
                        YieldResult::Dropped(value)
                    } else {
                        let evicted = if state.buffer.len() >= capacity { state.buffer.pop_front() } else { None };
                        state.buffer.push_back(value);
                        match evicted {
                            Some(old) => YieldResult::Dropped(old),
                            None => YieldResult::Enqueued { remaining: Some(capacity - state.buffer.len()) },
                        }
                    }
                }
            };
            let waker = if state.buffer.is_empty() { None } else { state.waker.take() };
            (result, waker)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        result
    }

    /// Finish the subscription from the producer side. Buffered values are still delivered.
    pub fn finish(&self) { self.0.finish(false); }

    pub fn is_terminated(&self) -> bool { self.0.state.lock().finished }

    /// Build a listener that feeds this continuation from a broadcast of `S`, forwarding
    /// only the values `project` maps to `Some`.
    pub fn filter_listener<S, P>(self, project: P) -> Listener<S>
    where
        T: Send + 'static,
        S: 'static,
        P: Fn(S) -> Option<T> + Send + Sync + 'static,
    {
        Listener::with_status(move |value: S| match project(value) {
            Some(value) => match self.yield_value(value) {
                YieldResult::Terminated => Delivery::Closed,
                _ => Delivery::Delivered,
            },
            None => {
                if self.is_terminated() {
                    Delivery::Closed
                } else {
                    Delivery::Delivered
                }
            }
        })
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) { self.0.finish(false); }
}

impl<T: Send + 'static> IntoListener<T> for Continuation<T> {
    fn into_listener(self) -> Listener<T> {
        Listener::with_status(move |value| match self.yield_value(value) {
            YieldResult::Terminated => Delivery::Closed,
            _ => Delivery::Delivered,
        })
    }
}

/// Keeps a continuation registered with its producer. Dropping it deregisters.
pub struct Registration {
    _guard: Box<dyn Any + Send + Sync>,
}

impl Registration {
    pub fn new<G: Any + Send + Sync>(guard: G) -> Self { Self { _guard: Box::new(guard) } }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("Registration") }
}

/// Registers a continuation with a producer. Returning `None` means the producer is
/// gone; the continuation is dropped and the subscription ends immediately.
type Build<T> = dyn Fn(Continuation<T>) -> Option<Registration> + Send + Sync;

enum Phase<T> {
    /// Lazily built, not registered until first polled
    Pending(Arc<Build<T>>),
    Active(#[allow(dead_code)] Option<Registration>),
    Terminated,
}

/// A single-use asynchronous sequence of values. See the [module docs](self).
pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
    phase: Phase<T>,
}

impl<T> Subscription<T> {
    /// A subscription registered right away
    pub fn eager<F>(policy: BufferingPolicy, build: F) -> Self
    where F: Fn(Continuation<T>) -> Option<Registration> + Send + Sync + 'static {
        Self::build_now(policy, &build)
    }

    /// A subscription that registers on first poll
    pub fn lazy<F>(policy: BufferingPolicy, build: F) -> Self
    where F: Fn(Continuation<T>) -> Option<Registration> + Send + Sync + 'static {
        Self { shared: Shared::new(policy), phase: Phase::Pending(Arc::new(build)) }
    }

    fn build_now(policy: BufferingPolicy, build: &Build<T>) -> Self {
        let shared = Shared::new(policy);
        let registration = build(Continuation(shared.clone()));
        Self { shared, phase: Phase::Active(registration) }
    }

    /// Whether the subscription is registered with its producer (or already finished)
    pub fn is_active(&self) -> bool { !matches!(self.phase, Phase::Pending(_)) }

    /// Number of values waiting to be consumed
    pub fn buffered_len(&self) -> usize { self.shared.state.lock().buffer.len() }

    /// Stop the subscription in place: deregister and discard anything buffered.
    pub fn cancel(&mut self) { self.terminate(); }

    fn activate(&mut self) {
        if let Phase::Pending(build) = &self.phase {
            let build = build.clone();
            trace!("lazy subscription registering on first poll");
            self.phase = Phase::Active(build(Continuation(self.shared.clone())));
        }
    }

    fn terminate(&mut self) {
        self.shared.finish(true);
        // dropping the registration deregisters the continuation
        self.phase = Phase::Terminated;
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        this.activate();
        if let Phase::Terminated = this.phase {
            return Poll::Ready(None);
        }

        let finished = {
            let mut state = this.shared.state.lock();
            if let Some(value) = state.buffer.pop_front() {
                state.waker = None;
                return Poll::Ready(Some(value));
            }
            if !state.finished && !state.waker.as_ref().is_some_and(|waker| waker.will_wake(cx.waker())) {
                state.waker = Some(cx.waker().clone());
            }
            state.finished
        };

        if finished {
            this.terminate();
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.phase {
            Phase::Terminated => (0, Some(0)),
            _ => (self.buffered_len(), None),
        }
    }
}

impl<T> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool { matches!(self.phase, Phase::Terminated) }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Any producer still holding the continuation sees Terminated from here on.
        // The registration is dropped right after, which deregisters it.
        self.shared.finish(true);
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Pending(_) => "pending",
            Phase::Active(_) => "active",
            Phase::Terminated => "terminated",
        };
        f.debug_struct("Subscription").field("phase", &phase).field("policy", &self.shared.policy).finish()
    }
}

/// When a [`StreamFactory`] registers the subscriptions it makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Register when the subscription is created. No value can be missed between
    /// obtaining the subscription and starting to consume it.
    #[default]
    Immediately,
    /// Register on first poll
    Lazily,
}

/// A restartable source of independent [`Subscription`]s
pub struct StreamFactory<T> {
    policy: BufferingPolicy,
    mode: BuildMode,
    build: Arc<Build<T>>,
}

impl<T> Clone for StreamFactory<T> {
    fn clone(&self) -> Self { Self { policy: self.policy, mode: self.mode, build: self.build.clone() } }
}

impl<T> StreamFactory<T> {
    pub fn new<F>(policy: BufferingPolicy, build: F) -> Self
    where F: Fn(Continuation<T>) -> Option<Registration> + Send + Sync + 'static {
        Self { policy, mode: BuildMode::default(), build: Arc::new(build) }
    }

    pub fn lazily(mut self) -> Self {
        self.mode = BuildMode::Lazily;
        self
    }

    pub fn immediately(mut self) -> Self {
        self.mode = BuildMode::Immediately;
        self
    }

    pub fn mode(&self) -> BuildMode { self.mode }
    pub fn policy(&self) -> BufferingPolicy { self.policy }

    /// Produce a brand-new subscription
    pub fn make(&self) -> Subscription<T> {
        match self.mode {
            BuildMode::Immediately => Subscription::build_now(self.policy, &*self.build),
            BuildMode::Lazily => Subscription { shared: Shared::new(self.policy), phase: Phase::Pending(self.build.clone()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcast;
    use futures::{FutureExt, StreamExt};
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn factory(broadcast: &Broadcast<u32>, policy: BufferingPolicy) -> StreamFactory<u32> {
        let broadcast = broadcast.clone();
        StreamFactory::new(policy, move |continuation: Continuation<u32>| {
            Some(Registration::new(broadcast.reference().listen(continuation)))
        })
    }

    #[test]
    fn unbounded_yields_in_order_and_wakes() {
        let broadcast = Broadcast::new();
        let mut sub = task::spawn(factory(&broadcast, BufferingPolicy::Unbounded).make());

        assert_pending!(sub.poll_next());
        broadcast.send(1);
        assert!(sub.is_woken());
        broadcast.send(2);
        broadcast.send(3);

        assert_ready_eq!(sub.poll_next(), Some(1));
        assert_ready_eq!(sub.poll_next(), Some(2));
        assert_ready_eq!(sub.poll_next(), Some(3));
        assert_pending!(sub.poll_next());
    }

    #[test]
    fn buffering_newest_keeps_most_recent() {
        let broadcast = Broadcast::new();
        let mut sub = factory(&broadcast, BufferingPolicy::newest(2)).make();
        for i in 1..=5 {
            broadcast.send(i);
        }
        assert_eq!(sub.buffered_len(), 2);
        assert_eq!(sub.next().now_or_never(), Some(Some(4)));
        assert_eq!(sub.next().now_or_never(), Some(Some(5)));
        assert_eq!(sub.next().now_or_never(), None);
    }

    #[test]
    fn buffering_oldest_keeps_first_arrivals() {
        let broadcast = Broadcast::new();
        let mut sub = factory(&broadcast, BufferingPolicy::oldest(2)).make();
        for i in 1..=5 {
            broadcast.send(i);
        }
        assert_eq!(sub.next().now_or_never(), Some(Some(1)));
        assert_eq!(sub.next().now_or_never(), Some(Some(2)));
        assert_eq!(sub.next().now_or_never(), None);

        // draining made room again
        broadcast.send(6);
        assert_eq!(sub.next().now_or_never(), Some(Some(6)));
    }

    #[test]
    fn yield_results_report_drops() {
        let continuation = Continuation(Shared::<u32>::new(BufferingPolicy::newest(1)));
        assert_eq!(continuation.yield_value(1), YieldResult::Enqueued { remaining: Some(0) });
        assert_eq!(continuation.yield_value(2), YieldResult::Dropped(1));

        let continuation = Continuation(Shared::<u32>::new(BufferingPolicy::oldest(1)));
        assert_eq!(continuation.yield_value(1), YieldResult::Enqueued { remaining: Some(0) });
        assert_eq!(continuation.yield_value(2), YieldResult::Dropped(2));

        continuation.finish();
        assert_eq!(continuation.yield_value(3), YieldResult::Terminated);
    }

    #[test]
    fn zero_limit_only_reaches_a_waiting_consumer() {
        let broadcast = Broadcast::new();
        let mut sub = task::spawn(factory(&broadcast, BufferingPolicy::newest(0)).make());

        broadcast.send(1); // nobody waiting
        assert_pending!(sub.poll_next());
        broadcast.send(2); // consumer parked, handed over
        broadcast.send(3); // consumer already has a value pending
        assert_ready_eq!(sub.poll_next(), Some(2));
        assert_pending!(sub.poll_next());
    }

    #[test]
    fn dropping_subscription_deregisters() {
        let broadcast = Broadcast::new();
        let factory = factory(&broadcast, BufferingPolicy::Unbounded);
        let first = factory.make();
        let second = factory.make();
        assert_eq!(broadcast.len(), 2);

        drop(first);
        assert_eq!(broadcast.len(), 1);
        broadcast.send(9);
        drop(second);
        assert_eq!(broadcast.len(), 0);
    }

    #[test]
    fn lazy_registers_on_first_poll() {
        let broadcast = Broadcast::new();
        let mut sub = task::spawn(factory(&broadcast, BufferingPolicy::Unbounded).lazily().make());
        assert_eq!(broadcast.len(), 0);
        broadcast.send(1); // not observed, not registered yet

        assert_pending!(sub.poll_next());
        assert_eq!(broadcast.len(), 1);
        broadcast.send(2);
        assert_ready_eq!(sub.poll_next(), Some(2));
    }

    #[test]
    fn producer_finish_drains_then_ends_for_good() {
        let shared = Shared::<u32>::new(BufferingPolicy::Unbounded);
        let continuation = Continuation(shared.clone());
        let mut sub = Subscription { shared, phase: Phase::Active(None) };

        continuation.yield_value(1);
        drop(continuation);

        assert_eq!(sub.next().now_or_never(), Some(Some(1)));
        assert_eq!(sub.next().now_or_never(), Some(None));
        assert!(sub.is_terminated());
        assert_eq!(sub.next().now_or_never(), Some(None));
    }

    #[test]
    fn missing_producer_ends_immediately() {
        let mut sub = Subscription::<u32>::eager(BufferingPolicy::Unbounded, |_continuation| None);
        assert_eq!(sub.next().now_or_never(), Some(None));
    }

    #[test]
    fn cancel_discards_buffer_and_deregisters() {
        let broadcast = Broadcast::new();
        let mut sub = factory(&broadcast, BufferingPolicy::Unbounded).make();
        broadcast.send(1);
        sub.cancel();
        assert_eq!(broadcast.len(), 0);
        assert_eq!(sub.next().now_or_never(), Some(None));
    }
}
