use parking_lot::lock_api::RawMutex;
use std::convert::identity;

use crate::{
    broadcast::{IntoListener, ListenerGuard},
    mirror::Mirror,
    observable::{Inner, Observable, Propagate, ReadObservable},
    stream::{BufferingPolicy, StreamFactory, Subscription},
    value::DefaultRawMutex,
};

/// An [`Observable`] over `Option<U>` whose subscriptions only ever see present values.
///
/// Absent values still update the canonical state, the change hook and the mirror; they
/// are filtered out before reaching any subscription from [`subscribe`](Self::subscribe),
/// including the replay of the current value. The buffering policy applies to the
/// filtered stream. Use [`subscribe_raw`](Self::subscribe_raw) to see the `None`s.
pub struct ObservableOption<U, R: RawMutex = DefaultRawMutex>(Observable<Option<U>, R>);

/// Read-only view of an [`ObservableOption`]
pub struct ReadObservableOption<U, R: RawMutex = DefaultRawMutex>(ReadObservable<Option<U>, R>);

impl<U, R: RawMutex> Clone for ObservableOption<U, R> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<U, R: RawMutex> Clone for ReadObservableOption<U, R> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<U, R: RawMutex> From<Observable<Option<U>, R>> for ObservableOption<U, R> {
    fn from(observable: Observable<Option<U>, R>) -> Self { Self(observable) }
}

impl<U> ObservableOption<U>
where U: Clone + Send + Sync + 'static
{
    pub fn new(initial: Option<U>) -> Self { Self(Observable::new(initial)) }
}

impl<U> Default for ObservableOption<U>
where U: Clone + Send + Sync + 'static
{
    fn default() -> Self { Self::new(None) }
}

impl<U, R> ObservableOption<U, R>
where
    U: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    pub fn get(&self) -> Option<U> { self.0.get() }

    pub fn with<X>(&self, f: impl FnOnce(&Option<U>) -> X) -> X { self.0.with(f) }

    pub fn is_some(&self) -> bool { self.0.with(Option::is_some) }

    pub fn set(&self, value: Option<U>) { self.0.set(value) }

    pub fn set_with(&self, value: Option<U>, propagate: Propagate) { self.0.set_with(value, propagate) }

    pub fn update(&self, transform: impl FnOnce(&Option<U>) -> Option<U>) -> Option<U> { self.0.update(transform) }

    pub fn update_with(&self, transform: impl FnOnce(&Option<U>) -> Option<U>, propagate: Propagate) -> Option<U> {
        self.0.update_with(transform, propagate)
    }

    pub fn mutate<X>(&self, body: impl FnOnce(&mut Option<U>) -> X) -> X { self.0.mutate(body) }

    pub fn mutate_with<X>(&self, body: impl FnOnce(&mut Option<U>) -> X, propagate: Propagate) -> X { self.0.mutate_with(body, propagate) }

    /// Clear the value, returning what was there. The `None` is propagated like any write.
    pub fn take(&self) -> Option<U> { self.0.mutate(Option::take) }

    pub fn clear(&self) { self.0.set(None) }

    /// Subscription to present values only
    pub fn subscribe(&self) -> Subscription<U> { self.stream_factory().make() }

    pub fn subscribe_lazy(&self) -> Subscription<U> { self.stream_factory().lazily().make() }

    pub fn stream_factory(&self) -> StreamFactory<U> { Inner::stream_factory(&self.0.0, identity) }

    /// Subscription to every value, absent ones included
    pub fn subscribe_raw(&self) -> Subscription<Option<U>> { self.0.subscribe() }

    pub fn observe<L>(&self, listener: L) -> ListenerGuard<Option<U>>
    where L: IntoListener<Option<U>> {
        self.0.observe(listener)
    }

    pub fn mirror(&self) -> Option<Mirror<Option<U>>> { self.0.mirror() }

    pub fn subscriber_count(&self) -> usize { self.0.subscriber_count() }

    pub fn buffering(&self) -> BufferingPolicy { self.0.buffering() }

    pub fn read(&self) -> ReadObservableOption<U, R> { ReadObservableOption(self.0.read()) }

    /// The underlying `Option<U>` observable
    pub fn as_observable(&self) -> &Observable<Option<U>, R> { &self.0 }
}

impl<U, R> ReadObservableOption<U, R>
where
    U: Clone + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    pub fn get(&self) -> Option<U> { self.0.get() }

    pub fn with<X>(&self, f: impl FnOnce(&Option<U>) -> X) -> X { self.0.with(f) }

    pub fn subscribe(&self) -> Subscription<U> { self.stream_factory().make() }

    pub fn subscribe_lazy(&self) -> Subscription<U> { self.stream_factory().lazily().make() }

    pub fn stream_factory(&self) -> StreamFactory<U> { Inner::stream_factory(&self.0.0, identity) }

    pub fn subscribe_raw(&self) -> Subscription<Option<U>> { self.0.subscribe() }

    pub fn mirror(&self) -> Option<Mirror<Option<U>>> { self.0.mirror() }

    pub fn subscriber_count(&self) -> usize { self.0.subscriber_count() }
}

impl<U: std::fmt::Debug, R: RawMutex> std::fmt::Debug for ObservableOption<U, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_tuple("ObservableOption").field(&self.0).finish() }
}
