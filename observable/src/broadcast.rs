use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// A unique identifier for a broadcast that cannot be forged or extracted.
/// Can only be created by a Broadcast and used for deduplication/comparison.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BroadcastId(usize);

impl From<BroadcastId> for usize {
    fn from(id: BroadcastId) -> Self { id.0 }
}
impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

/// Opaque identifier of one registration within a broadcast
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(usize);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

/// What a listener reports back after being handed a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The downstream is gone. The broadcast prunes the listener in the same pass.
    Closed,
}

/// A callback registered with a broadcast. Reports whether its downstream is still alive.
pub struct Listener<T>(Arc<dyn Fn(T) -> Delivery + Send + Sync + 'static>);

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> Listener<T> {
    /// Wrap a closure that reports whether its downstream is still alive
    pub fn with_status<F>(f: F) -> Self
    where F: Fn(T) -> Delivery + Send + Sync + 'static {
        Listener(Arc::new(f))
    }

    pub(crate) fn deliver(&self, value: T) -> Delivery { (self.0)(value) }
}

/// Trait for types that can be converted into broadcast listeners.
pub trait IntoListener<T> {
    /// Convert this type into a listener function that can be called on notifications.
    fn into_listener(self) -> Listener<T>;
}

/// The subscriber registry: fans a value out to every registered listener.
///
/// Two locks live here, both distinct from any value lock:
/// - a short map lock, only ever held to insert, remove or snapshot listeners
/// - a re-entrant delivery lock held for the duration of each send. Registration and
///   deregistration also take it, so they never interleave with an in-flight send.
///   Being re-entrant, a listener may register, deregister or send from inside its
///   own callback on the same thread.
pub struct Broadcast<T>(Arc<Inner<T>>);

struct Inner<T> {
    listeners: Mutex<HashMap<usize, Listener<T>>>,
    next_id: AtomicUsize,
    delivery: ReentrantMutex<()>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast").field("id", &self.id()).field("listeners", &self.len()).finish()
    }
}

/// A listen-only reference to a broadcast
pub struct Ref<'a, T>(&'a Broadcast<T>);

/// A registration handle. Dropping it removes the listener.
#[must_use = "dropping the guard immediately removes the listener"]
pub struct ListenerGuard<T> {
    inner: Weak<Inner<T>>,
    id: usize,
}

impl<T> ListenerGuard<T> {
    /// Get the broadcast ID that this guard is subscribed to
    pub fn broadcast_id(&self) -> BroadcastId {
        // A ListenerGuard does not keep the broadcast alive, but the address stays
        // reserved until all Arc/Weak references are dropped.
        BroadcastId(self.inner.as_ptr() as usize)
    }

    pub fn listener_id(&self) -> ListenerId { ListenerId(self.id) }
}

impl<T> std::fmt::Debug for ListenerGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListenerGuard({}/{})", self.broadcast_id(), self.id)
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Broadcast<T> {
    /// Creates a new Broadcast struct
    pub fn new() -> Self {
        Self(Arc::new(Inner { listeners: Mutex::new(HashMap::new()), next_id: AtomicUsize::new(0), delivery: ReentrantMutex::new(()) }))
    }

    /// Get the unique identifier for this broadcast
    pub fn id(&self) -> BroadcastId { BroadcastId(Arc::as_ptr(&self.0) as usize) }

    /// Number of currently registered listeners
    pub fn len(&self) -> usize { self.0.listeners.lock().len() }

    pub fn is_empty(&self) -> bool { self.0.listeners.lock().is_empty() }

    /// Get a read-only reference to this sender that can only subscribe to notifications.
    /// This avoids cloning the sender while still forbidding the user from sending notifications.
    pub fn reference(&self) -> Ref<'_, T> { Ref(self) }

    /// Hold the delivery lock. While the returned guard lives, no send from another
    /// thread can start, and registrations from other threads wait.
    pub(crate) fn exclusive(&self) -> ReentrantMutexGuard<'_, ()> { self.0.delivery.lock() }
}

impl<T: Clone> Broadcast<T> {
    /// Sends a value to every listener registered when the send begins.
    ///
    /// Listeners are invoked synchronously on the calling thread and must be quick
    /// hand-offs (enqueue and return). Listeners that report [`Delivery::Closed`]
    /// are removed before this returns.
    pub fn send(&self, value: T) {
        let _delivery = self.0.delivery.lock();

        // Snapshot so the map lock is not held during callback execution
        let subscribers: Vec<(usize, Listener<T>)> = self.0.listeners.lock().iter().map(|(id, l)| (*id, l.clone())).collect();

        let mut closed = Vec::new();
        // clone the value for each subscriber except the last one
        if let Some(((last_id, last), rest)) = subscribers.split_last() {
            for (id, listener) in rest {
                if listener.deliver(value.clone()) == Delivery::Closed {
                    closed.push(*id);
                }
            }
            if last.deliver(value) == Delivery::Closed {
                closed.push(*last_id);
            }
        }
        drop(subscribers);

        if !closed.is_empty() {
            let pruned: Vec<Listener<T>> = {
                let mut listeners = self.0.listeners.lock();
                closed.iter().filter_map(|id| listeners.remove(id)).collect()
            };
            trace!("broadcast {} pruned {} closed listeners", self.id(), pruned.len());
            // pruned listeners drop here, outside the map lock
        }
    }
}

impl<T> Ref<'_, T> {
    /// Subscribe to notifications from the associated sender.
    pub fn listen<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        let inner = &self.0.0;
        let _delivery = inner.delivery.lock();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut listeners = inner.listeners.lock();
            listeners.insert(id, listener.into_listener());
            listeners.len()
        };
        trace!("broadcast {} registered listener {} ({} active)", self.broadcast_id(), id, count);
        ListenerGuard { inner: Arc::downgrade(inner), id }
    }

    /// Get a unique identifier for this broadcast (for deduplication purposes)
    pub fn broadcast_id(&self) -> BroadcastId { self.0.id() }
}

impl<T> Drop for ListenerGuard<T> {
    /// Automatically unsubscribes when the subscription handle is dropped.
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let _delivery = inner.delivery.lock();
            let removed = inner.listeners.lock().remove(&self.id);
            if removed.is_some() {
                trace!("broadcast {} deregistered listener {}", self.broadcast_id(), self.id);
            }
        }
    }
}

// IntoListener implementations for various types

impl<F, T> IntoListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_listener(self) -> Listener<T> {
        Listener::with_status(move |value| {
            self(value);
            Delivery::Delivered
        })
    }
}

impl<T> IntoListener<T> for Listener<T> {
    fn into_listener(self) -> Listener<T> { self }
}

impl<T: 'static> IntoListener<T> for Arc<dyn Fn(T) + Send + Sync + 'static> {
    fn into_listener(self) -> Listener<T> {
        Listener::with_status(move |value| {
            self(value);
            Delivery::Delivered
        })
    }
}

#[cfg(feature = "tokio")]
impl<T> IntoListener<T> for tokio::sync::mpsc::UnboundedSender<T>
where T: Send + 'static
{
    fn into_listener(self) -> Listener<T> {
        Listener::with_status(move |value| match self.send(value) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Closed,
        })
    }
}

impl<T> IntoListener<T> for std::sync::mpsc::Sender<T>
where T: Send + 'static
{
    fn into_listener(self) -> Listener<T> {
        Listener::with_status(move |value| match self.send(value) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_multiple_subscribers() {
        let sender = Broadcast::<()>::new();

        let counter = Arc::new(Mutex::new(0));

        let _sub1 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 1)
        };

        let sub2 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 10)
        };

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 11);

        drop(sub2);

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 12);
        assert_eq!(sender.len(), 1);
    }

    #[test]
    #[cfg(feature = "tokio")]
    fn test_channel_sender_subscriber() {
        let sender = Broadcast::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        let _sub = sender.reference().listen(tx);

        sender.send(1);
        sender.send(2);

        assert_eq!(rx.try_recv().ok(), Some(1));
        assert_eq!(rx.try_recv().ok(), Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_listener_is_pruned_during_send() {
        let sender = Broadcast::new();
        let (tx, rx) = std::sync::mpsc::channel::<u32>();
        let guard = sender.reference().listen(tx);
        assert_eq!(sender.len(), 1);

        drop(rx);
        sender.send(7);
        assert_eq!(sender.len(), 0);

        // removal through the guard afterwards is a no-op
        drop(guard);
        assert_eq!(sender.len(), 0);
    }

    #[test]
    fn test_shared_callback_listener() {
        let sender = Broadcast::<String>::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let callback: Arc<dyn Fn(String) + Send + Sync> = {
            let hits = hits.clone();
            Arc::new(move |value: String| hits.lock().unwrap().push(value))
        };
        let _a = sender.reference().listen(callback.clone());
        let _b = sender.reference().listen(callback);

        sender.send("a".to_string());
        assert_eq!(*hits.lock().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_guard_outliving_broadcast() {
        let sender = Broadcast::<u8>::new();
        let guard = sender.reference().listen(|_| {});
        let id = sender.id();
        drop(sender);
        assert_eq!(guard.broadcast_id(), id);
        drop(guard);
    }

    #[test]
    fn test_reentrant_subscription_during_send() {
        let sender = Broadcast::<()>::new();
        let counter = Arc::new(Mutex::new(0));

        // A listener that registers and drops another listener while being notified
        let sender_clone = sender.clone();
        let counter_clone = counter.clone();
        let _sub = sender.reference().listen(move |_| {
            *counter_clone.lock().unwrap() += 1;
            let _temp_sub = sender_clone.reference().listen(|_| {});
        });

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 1);

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 2);
        assert_eq!(sender.len(), 1);
    }
}
