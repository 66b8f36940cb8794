use parking_lot::lock_api::RawMutex;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, trace};

use crate::{
    broadcast::{Broadcast, IntoListener, Listener, ListenerGuard},
    mirror::{Dispatch, Mirror, SyncGuards},
    optional::ObservableOption,
    stream::{BufferingPolicy, Continuation, Registration, StreamFactory, Subscription},
    value::{DefaultRawMutex, ValueCell},
};

/// Where a write propagates after it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Propagate {
    /// Broadcast the new value to subscribers
    pub notify: bool,
    /// Push the new value into the mirror
    pub sync_mirror: bool,
}

impl Propagate {
    pub const ALL: Propagate = Propagate { notify: true, sync_mirror: true };
    /// Mirror only, subscribers are not told
    pub const SILENT: Propagate = Propagate { notify: false, sync_mirror: true };
    /// Subscribers only, the mirror is left alone
    pub const NO_MIRROR: Propagate = Propagate { notify: true, sync_mirror: false };
    /// Neither. The change hook still runs.
    pub const LOCAL: Propagate = Propagate { notify: false, sync_mirror: false };
}

impl Default for Propagate {
    fn default() -> Self { Propagate::ALL }
}

/// Invoked synchronously with the new value on every successful write, after the
/// value is stored and before subscribers are notified. Must not block or panic;
/// failures belong inside the hook.
pub trait ChangeHook<T>: Send + Sync {
    fn changed(&self, value: &T);
}

impl<T, F> ChangeHook<T> for F
where F: Fn(&T) + Send + Sync
{
    fn changed(&self, value: &T) { self(value) }
}

/// A thread-safe observable value.
///
/// Holds one canonical value. Any number of independent [`Subscription`]s observe it
/// change, each starting with the value current when it registered. An optional
/// [`Mirror`] keeps a UI-bound copy in sync in both directions.
///
/// Cloning shares the same value. Everything is torn
/// down when the last `Observable` or [`ReadObservable`] handle is dropped; live
/// subscriptions then finish after draining what they already buffered.
///
/// ```rust
/// use ankurah_observable::*;
/// use futures::StreamExt;
///
/// # futures::executor::block_on(async {
/// let counter = Observable::new(0);
/// let mut changes = counter.subscribe();
///
/// counter.set(1);
/// counter.update(|n| n + 1);
/// counter.mutate(|n| *n += 1);
///
/// let seen: Vec<i32> = changes.by_ref().take(4).collect().await;
/// assert_eq!(seen, [0, 1, 2, 3]);
/// assert_eq!(counter.get(), 3);
/// # });
/// ```
pub struct Observable<T, R: RawMutex = DefaultRawMutex>(pub(crate) Arc<Inner<T, R>>);

/// Read-only capability view of an [`Observable`]: read, subscribe and mirror, no writes.
pub struct ReadObservable<T, R: RawMutex = DefaultRawMutex>(pub(crate) Arc<Inner<T, R>>);

pub(crate) struct Inner<T, R: RawMutex> {
    value: ValueCell<T, R>,
    broadcast: Broadcast<T>,
    buffering: BufferingPolicy,
    hooks: Vec<Box<dyn ChangeHook<T>>>,
    dispatch: Option<Arc<dyn Dispatch>>,
    mirror: OnceLock<Mirror<T>>,
    guards: Arc<SyncGuards>,
    this: Weak<Inner<T, R>>,
}

impl<T, R: RawMutex> Clone for Observable<T, R> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T, R: RawMutex> Clone for ReadObservable<T, R> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> Observable<T>
where T: Clone + Send + Sync + 'static
{
    /// An observable with unbounded buffering, a fresh lock and no mirror
    pub fn new(initial: T) -> Self { ObservableBuilder::new(initial).build() }

    pub fn builder(initial: T) -> ObservableBuilder<T> { ObservableBuilder::new(initial) }
}

impl<T, R> Observable<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    /// Snapshot of the current value
    pub fn get(&self) -> T { self.0.value.value() }

    /// Borrow the current value. `f` runs with writes held off, so it must be quick. It
    /// may drop subscriptions of this observable but must not read, write or subscribe to it.
    pub fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X { self.0.with(f) }

    /// Store `value` and propagate it everywhere
    pub fn set(&self, value: T) { self.set_with(value, Propagate::ALL) }

    pub fn set_with(&self, value: T, propagate: Propagate) {
        let _delivery = self.0.broadcast.exclusive();
        self.0.value.set(value.clone());
        self.0.publish(value, propagate);
    }

    /// Replace the value with `transform(current)`.
    ///
    /// The read, the transform and the write happen under the value lock, and the
    /// whole update is serialized with other writes, so concurrent transforms never lose
    /// updates. `transform` must be quick.
    pub fn update(&self, transform: impl FnOnce(&T) -> T) -> T { self.update_with(transform, Propagate::ALL) }

    pub fn update_with(&self, transform: impl FnOnce(&T) -> T, propagate: Propagate) -> T {
        let _delivery = self.0.broadcast.exclusive();
        let value = self.0.value.with_mut(|current| {
            *current = transform(current);
            current.clone()
        });
        self.0.publish(value.clone(), propagate);
        value
    }

    /// Mutate the value in place with the lock held for the duration of `body`, then
    /// propagate the result. `body` must be quick and must not touch this observable.
    pub fn mutate<X>(&self, body: impl FnOnce(&mut T) -> X) -> X { self.mutate_with(body, Propagate::ALL) }

    pub fn mutate_with<X>(&self, body: impl FnOnce(&mut T) -> X, propagate: Propagate) -> X {
        let _delivery = self.0.broadcast.exclusive();
        let (out, value) = self.0.value.with_mut(|current| {
            let out = body(current);
            (out, current.clone())
        });
        self.0.publish(value, propagate);
        out
    }

    /// A fresh subscription, registered immediately. Its first item is the current value.
    pub fn subscribe(&self) -> Subscription<T> { self.stream_factory().make() }

    /// A fresh subscription that registers (and replays the then-current value) on first poll
    pub fn subscribe_lazy(&self) -> Subscription<T> { self.stream_factory().lazily().make() }

    /// The restartable factory behind [`subscribe`](Self::subscribe)
    pub fn stream_factory(&self) -> StreamFactory<T> { Inner::stream_factory(&self.0, Some) }

    /// Push-style listener for future changes. No replay of the current value.
    pub fn observe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        self.0.register(listener.into_listener(), false)
    }

    /// The UI-bound mirror, created on first access with the current value. `None` when
    /// the observable was built without a mirror context.
    pub fn mirror(&self) -> Option<Mirror<T>> { Inner::mirror(&self.0) }

    /// Number of live subscriptions and listeners
    pub fn subscriber_count(&self) -> usize { self.0.broadcast.len() }

    pub fn buffering(&self) -> BufferingPolicy { self.0.buffering }

    /// Share without handing out write access
    pub fn read(&self) -> ReadObservable<T, R> { ReadObservable(self.0.clone()) }
}

impl<T, R> ReadObservable<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    pub fn get(&self) -> T { self.0.value.value() }

    pub fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X { self.0.with(f) }

    pub fn subscribe(&self) -> Subscription<T> { self.stream_factory().make() }

    pub fn subscribe_lazy(&self) -> Subscription<T> { self.stream_factory().lazily().make() }

    pub fn stream_factory(&self) -> StreamFactory<T> { Inner::stream_factory(&self.0, Some) }

    pub fn observe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        self.0.register(listener.into_listener(), false)
    }

    pub fn mirror(&self) -> Option<Mirror<T>> { Inner::mirror(&self.0) }

    pub fn subscriber_count(&self) -> usize { self.0.broadcast.len() }

}

impl<T, R> Inner<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    /// Same lock order as writers: delivery, then value
    fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X {
        let _delivery = self.broadcast.exclusive();
        self.value.with(f)
    }

    /// Everything that follows a stored write. The caller holds the delivery lock, which
    /// keeps broadcasts and mirror jobs in the order the writes were applied.
    fn publish(&self, value: T, propagate: Propagate) {
        for hook in &self.hooks {
            hook.changed(&value);
        }
        if propagate.notify {
            self.broadcast.send(value);
        }
        if propagate.sync_mirror {
            self.sync_mirror();
        }
    }

    fn sync_mirror(&self) {
        if !self.guards.allow_canonical_to_mirror() {
            trace!("canonical write originated from mirror; not pushing back");
            return;
        }
        // a mirror that does not exist yet will start from the current value anyway
        let (Some(mirror), Some(dispatch)) = (self.mirror.get(), self.dispatch.as_ref()) else { return };
        let (mirror, this) = (mirror.clone(), self.this.clone());
        // read when the job runs, never snapshotted at dispatch
        dispatch.dispatch(Box::new(move || {
            if let Some(inner) = this.upgrade() {
                mirror.apply_from_canonical(inner.value.value());
            }
        }));
    }

    /// A write made directly on the mirror
    fn accept_from_mirror(&self, value: T) {
        // cleared inside the delivery lock so writers on other threads never see it
        let _delivery = self.broadcast.exclusive();
        self.guards.suppress_canonical_to_mirror(|| {
            self.value.set(value.clone());
            self.publish(value, Propagate::NO_MIRROR);
        });
    }

    /// Register a listener, optionally handing it the current value first. Done under
    /// the delivery lock, so it lands strictly before or strictly after any write.
    pub(crate) fn register(&self, listener: Listener<T>, replay: bool) -> ListenerGuard<T> {
        let _delivery = self.broadcast.exclusive();
        if replay {
            listener.deliver(self.value.value());
        }
        let guard = self.broadcast.reference().listen(listener);
        debug!("observable {} registered subscriber {} ({} active)", self.broadcast.id(), guard.listener_id(), self.broadcast.len());
        guard
    }

    /// Subscriptions of `S`, fed with every value `project` maps to `Some`
    pub(crate) fn stream_factory<S, P>(this: &Arc<Self>, project: P) -> StreamFactory<S>
    where
        S: Send + 'static,
        P: Fn(T) -> Option<S> + Clone + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(this);
        StreamFactory::new(this.buffering, move |continuation: Continuation<S>| {
            let inner = weak.upgrade()?;
            let guard = inner.register(continuation.filter_listener(project.clone()), true);
            Some(Registration::new(guard))
        })
    }

    pub(crate) fn mirror(this: &Arc<Self>) -> Option<Mirror<T>> {
        this.dispatch.as_ref()?;
        // held across initialization so no write slips in between reading the value and
        // the mirror becoming visible to sync_mirror
        let _delivery = this.broadcast.exclusive();
        let mirror = this.mirror.get_or_init(|| {
            let weak = Arc::downgrade(this);
            let delegate = move |value: &T| {
                if let Some(inner) = weak.upgrade() {
                    inner.accept_from_mirror(value.clone());
                }
            };
            debug!("observable {} creating mirror", this.broadcast.id());
            Mirror::with_guards(this.value.value(), Some(Box::new(delegate)), this.guards.clone())
        });
        Some(mirror.clone())
    }
}

impl<T, R: RawMutex> Drop for Inner<T, R> {
    fn drop(&mut self) { debug!("observable {} torn down with {} subscribers", self.broadcast.id(), self.broadcast.len()); }
}

/// Configures an [`Observable`] before it is built
pub struct ObservableBuilder<T, R: RawMutex = DefaultRawMutex> {
    initial: T,
    lock: R,
    buffering: BufferingPolicy,
    hooks: Vec<Box<dyn ChangeHook<T>>>,
    dispatch: Option<Arc<dyn Dispatch>>,
    eager_mirror: bool,
}

impl<T> ObservableBuilder<T> {
    pub fn new(initial: T) -> Self {
        Self { initial, lock: DefaultRawMutex::INIT, buffering: BufferingPolicy::default(), hooks: Vec::new(), dispatch: None, eager_mirror: false }
    }
}

impl<T, R: RawMutex> ObservableBuilder<T, R> {
    /// Buffering applied to every subscription of this observable
    pub fn buffering(mut self, policy: BufferingPolicy) -> Self {
        self.buffering = policy;
        self
    }

    /// Guard the value with `lock` instead of a fresh `parking_lot` mutex. The
    /// observable takes ownership; it is never shared with another instance.
    pub fn lock<R2: RawMutex>(self, lock: R2) -> ObservableBuilder<T, R2> {
        ObservableBuilder {
            initial: self.initial,
            lock,
            buffering: self.buffering,
            hooks: self.hooks,
            dispatch: self.dispatch,
            eager_mirror: self.eager_mirror,
        }
    }

    /// Enable the mirror, running its writes on `dispatch`
    pub fn mirror_on(mut self, dispatch: impl Dispatch + 'static) -> Self {
        self.dispatch = Some(Arc::new(dispatch));
        self
    }

    /// Create the mirror at build time rather than on first access
    pub fn eager_mirror(mut self) -> Self {
        self.eager_mirror = true;
        self
    }

    pub fn on_change(mut self, hook: impl ChangeHook<T> + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub(crate) fn initial_mut(&mut self) -> &mut T { &mut self.initial }
}

impl<T, R> ObservableBuilder<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    pub fn build(self) -> Observable<T, R> {
        let inner = Arc::new_cyclic(|this| Inner {
            value: ValueCell::with_lock(self.lock, self.initial),
            broadcast: Broadcast::new(),
            buffering: self.buffering,
            hooks: self.hooks,
            dispatch: self.dispatch,
            mirror: OnceLock::new(),
            guards: Arc::new(SyncGuards::new()),
            this: this.clone(),
        });
        if self.eager_mirror && inner.dispatch.is_none() {
            debug!("eager_mirror requested without a mirror context; ignoring");
        }
        if self.eager_mirror {
            Inner::mirror(&inner);
        }
        Observable(inner)
    }
}

impl<U, R> ObservableBuilder<Option<U>, R>
where
    U: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    /// Build the optional-unwrapping variant
    pub fn build_optional(self) -> ObservableOption<U, R> { ObservableOption::from(self.build()) }
}

impl<T: std::fmt::Debug, R: RawMutex> std::fmt::Debug for Observable<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &self.0.value)
            .field("subscribers", &self.0.broadcast.len())
            .field("buffering", &self.0.buffering)
            .finish()
    }
}

impl<T: std::fmt::Debug, R: RawMutex> std::fmt::Debug for ReadObservable<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadObservable").field("value", &self.0.value).field("subscribers", &self.0.broadcast.len()).finish()
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self { Self::new(T::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[test]
    fn replays_current_value_on_subscribe() {
        let observable = Observable::new("a");
        observable.set("b");
        let mut sub = observable.subscribe();
        assert_eq!(sub.next().now_or_never(), Some(Some("b")));
        assert_eq!(sub.next().now_or_never(), None);
    }

    #[test]
    fn update_returns_the_stored_value() {
        let observable = Observable::new(10);
        assert_eq!(observable.update(|v| v * 2), 20);
        assert_eq!(observable.mutate(|v| std::mem::replace(v, 1)), 20);
        assert_eq!(observable.get(), 1);
    }

    #[test]
    fn hook_runs_even_when_not_notifying() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observable = {
            let seen = seen.clone();
            Observable::builder(0).on_change(move |v: &i32| seen.lock().unwrap().push(*v)).build()
        };
        observable.set_with(1, Propagate::LOCAL);
        observable.update(|v| v + 1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn observe_does_not_replay() {
        let observable = Observable::new(1);
        let (tx, rx) = std::sync::mpsc::channel();
        let guard = observable.observe(tx);
        observable.set(2);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2]);
        drop(guard);
        assert_eq!(observable.subscriber_count(), 0);
    }

    #[test]
    fn mirror_requires_a_context() {
        let observable = Observable::new(0);
        assert!(observable.mirror().is_none());
        let observable = Observable::builder(0).eager_mirror().build();
        assert!(observable.mirror().is_none());
    }

    #[test]
    fn read_view_shares_state() {
        let observable = Observable::new(vec![1]);
        let view = observable.read();
        let mut sub = view.subscribe();
        observable.mutate(|v| v.push(2));
        assert_eq!(view.get(), vec![1, 2]);
        assert_eq!(sub.next().now_or_never(), Some(Some(vec![1])));
        assert_eq!(sub.next().now_or_never(), Some(Some(vec![1, 2])));
        assert_eq!(view.subscriber_count(), 1);
    }
}
