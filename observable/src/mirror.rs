//! The UI-bound projection of a canonical value.
//!
//! A [`Mirror`] is written from exactly one designated execution context, the one a
//! [`Dispatch`] implementation runs jobs on (typically a UI/main thread). Writes coming
//! from the canonical side arrive as dispatched jobs; writes made directly on the mirror
//! (by a UI binding) are reported to the [`MirrorObserver`] given at construction.
//! [`SyncGuards`] keep the two directions from feeding each other.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

use crate::broadcast::{Broadcast, IntoListener, ListenerGuard};

/// A unit of work to run on the mirror's execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that runs jobs one at a time, in dispatch order.
pub trait Dispatch: Send + Sync {
    /// Schedule `job`. Must not wait for it to run.
    fn dispatch(&self, job: Job);
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn dispatch(&self, job: Job) { (**self).dispatch(job) }
}

/// Runs jobs immediately on the dispatching thread. For headless use and tests;
/// mirror writes then happen on whichever thread performs the canonical update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Dispatch for Inline {
    fn dispatch(&self, job: Job) { job() }
}

#[cfg(feature = "tokio")]
pub use self::main_context::{MainContext, MainLoop};

#[cfg(feature = "tokio")]
mod main_context {
    use super::{Dispatch, Job};
    use tokio::sync::mpsc;
    use tracing::debug;

    /// Dispatch handle for a designated main context. Cheap to clone.
    #[derive(Clone)]
    pub struct MainContext {
        tx: mpsc::UnboundedSender<Job>,
    }

    /// The receiving end, owned by whatever drives the main context
    pub struct MainLoop {
        rx: mpsc::UnboundedReceiver<Job>,
    }

    impl MainContext {
        #[allow(clippy::new_ret_no_self)]
        pub fn new() -> (MainContext, MainLoop) {
            let (tx, rx) = mpsc::unbounded_channel();
            (MainContext { tx }, MainLoop { rx })
        }
    }

    impl Dispatch for MainContext {
        fn dispatch(&self, job: Job) {
            if self.tx.send(job).is_err() {
                debug!("MainContext dispatch after MainLoop was dropped; job discarded");
            }
        }
    }

    impl std::fmt::Debug for MainContext {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("MainContext") }
    }

    impl MainLoop {
        /// Run jobs as they arrive until every MainContext handle is gone
        pub async fn run(mut self) {
            while let Some(job) = self.rx.recv().await {
                job();
            }
        }

        /// Run everything queued so far on the calling thread. Returns how many jobs ran.
        pub fn run_pending(&mut self) -> usize {
            let mut ran = 0;
            while let Ok(job) = self.rx.try_recv() {
                job();
                ran += 1;
            }
            ran
        }
    }
}

/// Re-entrancy flags shared by a canonical value and its mirror. Both start out allowed.
#[derive(Debug)]
pub struct SyncGuards {
    mirror_to_canonical: AtomicBool,
    canonical_to_mirror: AtomicBool,
}

impl Default for SyncGuards {
    fn default() -> Self { Self::new() }
}

impl SyncGuards {
    pub fn new() -> Self { Self { mirror_to_canonical: AtomicBool::new(true), canonical_to_mirror: AtomicBool::new(true) } }

    pub fn allow_mirror_to_canonical(&self) -> bool { self.mirror_to_canonical.load(Ordering::Acquire) }

    pub fn allow_canonical_to_mirror(&self) -> bool { self.canonical_to_mirror.load(Ordering::Acquire) }

    /// Run `f` with mirror → canonical propagation switched off
    pub fn suppress_mirror_to_canonical<X>(&self, f: impl FnOnce() -> X) -> X { Self::suppressed(&self.mirror_to_canonical, f) }

    /// Run `f` with canonical → mirror propagation switched off
    pub fn suppress_canonical_to_mirror<X>(&self, f: impl FnOnce() -> X) -> X { Self::suppressed(&self.canonical_to_mirror, f) }

    fn suppressed<X>(flag: &AtomicBool, f: impl FnOnce() -> X) -> X {
        let previous = flag.swap(false, Ordering::AcqRel);
        // restored even if f panics
        let _restore = scopeguard::guard(previous, |previous| flag.store(previous, Ordering::Release));
        f()
    }
}

/// Delegate told about writes made directly on a mirror
pub trait MirrorObserver<T>: Send + Sync {
    fn on_changed(&self, value: &T);
}

impl<T, F> MirrorObserver<T> for F
where F: Fn(&T) + Send + Sync
{
    fn on_changed(&self, value: &T) { self(value) }
}

/// A UI-bindable copy of a value. Cloning shares the same mirror.
pub struct Mirror<T>(Arc<Inner<T>>);

struct Inner<T> {
    value: RwLock<T>,
    revision: AtomicU64,
    observers: Broadcast<T>,
    delegate: Option<Box<dyn MirrorObserver<T>>>,
    guards: Arc<SyncGuards>,
}

impl<T> Clone for Mirror<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T: Clone + Send + 'static> Mirror<T> {
    /// A mirror whose direct writes are reported to `delegate`
    pub fn new(initial: T, delegate: impl MirrorObserver<T> + 'static) -> Self {
        Self::with_guards(initial, Some(Box::new(delegate)), Arc::new(SyncGuards::new()))
    }

    /// A mirror nobody is told about
    pub fn detached(initial: T) -> Self { Self::with_guards(initial, None, Arc::new(SyncGuards::new())) }

    pub(crate) fn with_guards(initial: T, delegate: Option<Box<dyn MirrorObserver<T>>>, guards: Arc<SyncGuards>) -> Self {
        Self(Arc::new(Inner { value: RwLock::new(initial), revision: AtomicU64::new(0), observers: Broadcast::new(), delegate, guards }))
    }

    pub fn get(&self) -> T { self.0.value.read().clone() }

    pub fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X { f(&*self.0.value.read()) }

    /// Number of writes this mirror has seen, from either direction
    pub fn revision(&self) -> u64 { self.0.revision.load(Ordering::Acquire) }

    pub fn guards(&self) -> &SyncGuards { &self.0.guards }

    /// Write the mirror directly, as a UI binding would. Must be called on the mirror's
    /// execution context. The delegate hears about it unless the write is an echo of a
    /// canonical update.
    pub fn set(&self, value: T) {
        self.write(value.clone());
        if let Some(delegate) = &self.0.delegate {
            if self.0.guards.allow_mirror_to_canonical() {
                delegate.on_changed(&value);
            } else {
                trace!("mirror write originated from canonical side; not propagating back");
            }
        }
    }

    /// Write a value coming from the canonical side
    pub(crate) fn apply_from_canonical(&self, value: T) { self.0.guards.suppress_mirror_to_canonical(|| self.set(value)) }

    /// Push-style binding for UI observers: `listener` runs after every mirror write
    pub fn observe<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoListener<T> {
        self.0.observers.reference().listen(listener)
    }

    fn write(&self, value: T) {
        *self.0.value.write() = value.clone();
        self.0.revision.fetch_add(1, Ordering::AcqRel);
        self.0.observers.send(value);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mirror<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror").field("value", &*self.0.value.read()).field("revision", &self.0.revision.load(Ordering::Relaxed)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn direct_write_reaches_delegate() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mirror = {
            let seen = seen.clone();
            Mirror::new(0, move |v: &i32| seen.lock().unwrap().push(*v))
        };

        mirror.set(1);
        mirror.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(mirror.get(), 2);
        assert_eq!(mirror.revision(), 2);
    }

    #[test]
    fn canonical_write_is_not_echoed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mirror = {
            let seen = seen.clone();
            Mirror::new(0, move |v: &i32| seen.lock().unwrap().push(*v))
        };

        mirror.apply_from_canonical(5);
        assert_eq!(mirror.get(), 5);
        assert!(seen.lock().unwrap().is_empty());
        assert!(mirror.guards().allow_mirror_to_canonical());
    }

    #[test]
    fn observers_see_every_write() {
        let mirror = Mirror::detached("a".to_string());
        let (tx, rx) = std::sync::mpsc::channel();
        let _guard = mirror.observe(tx);

        mirror.set("b".to_string());
        mirror.apply_from_canonical("c".to_string());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn guards_restore_after_panic() {
        let guards = SyncGuards::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guards.suppress_canonical_to_mirror(|| {
                assert!(!guards.allow_canonical_to_mirror());
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert!(guards.allow_canonical_to_mirror());
    }

    #[test]
    fn nested_suppression_restores_outer_state() {
        let guards = SyncGuards::new();
        guards.suppress_mirror_to_canonical(|| {
            guards.suppress_mirror_to_canonical(|| assert!(!guards.allow_mirror_to_canonical()));
            assert!(!guards.allow_mirror_to_canonical());
        });
        assert!(guards.allow_mirror_to_canonical());
    }

    #[test]
    #[cfg(feature = "tokio")]
    fn main_context_runs_jobs_in_order() {
        let (ctx, mut main) = MainContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctx.dispatch(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert!(order.lock().unwrap().is_empty());
        assert_eq!(main.run_pending(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(main.run_pending(), 0);
    }
}
