use parking_lot::lock_api::{Mutex, RawMutex};

/// The lock used when a container is not given one explicitly
pub type DefaultRawMutex = parking_lot::RawMutex;

/// The canonical value, guarded by a single mutual-exclusion primitive.
///
/// Any [`RawMutex`] implementation can stand in for the default `parking_lot` lock
/// (a spin lock, for instance). Each cell owns its lock exclusively. Critical sections are
/// short and never suspend, and a closure passed to [`ValueCell::with`] or
/// [`ValueCell::with_mut`] runs while the lock is held, so it must be quick and must not
/// touch the same cell again.
pub struct ValueCell<T, R: RawMutex = DefaultRawMutex>(Mutex<R, T>);

impl<T, R: RawMutex> ValueCell<T, R> {
    pub fn new(value: T) -> Self { Self(Mutex::new(value)) }

    /// Create a cell around an explicitly supplied raw lock
    pub fn with_lock(raw: R, value: T) -> Self { Self(Mutex::from_raw(raw, value)) }

    pub fn set(&self, value: T) { *self.0.lock() = value; }

    /// Store `value`, returning the previous one
    pub fn replace(&self, value: T) -> T { std::mem::replace(&mut *self.0.lock(), value) }

    pub fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X {
        let guard = self.0.lock();
        f(&*guard)
    }

    /// Read-modify-write with the lock held for the whole of `f`
    pub fn with_mut<X>(&self, f: impl FnOnce(&mut T) -> X) -> X {
        let mut guard = self.0.lock();
        f(&mut *guard)
    }

    pub fn into_inner(self) -> T { self.0.into_inner() }
}

impl<T: Clone, R: RawMutex> ValueCell<T, R> {
    /// Returns a clone of the current value
    pub fn value(&self) -> T { self.0.lock().clone() }
}

impl<T: std::fmt::Debug, R: RawMutex> std::fmt::Debug for ValueCell<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.try_lock() {
            Some(value) => f.debug_tuple("ValueCell").field(&*value).finish(),
            None => f.write_str("ValueCell(<locked>)"),
        }
    }
}
