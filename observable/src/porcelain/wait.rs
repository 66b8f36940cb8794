use futures::StreamExt;
use std::future::Future;
use tracing::debug;

use super::Subscribe;

/// Waiting on observable values asynchronously
pub trait Wait: Subscribe {
    /// Resolve once the current or a future value equals `target`
    fn wait_value(&self, target: Self::Item) -> impl Future<Output = ()> + Send
    where Self::Item: PartialEq + Send + Sync;

    /// Resolve with the first output of `predicate` over the current and future values
    fn wait_for<F, R>(&self, predicate: F) -> impl Future<Output = R::Output> + Send
    where
        F: Fn(&Self::Item) -> R + Send,
        R: WaitResult;
}

/// Helper trait for `wait_for` to allow flexible predicate return types.
///
/// ## Semantics
/// - `result()` returns `Some(output)` to stop waiting and return `output`
/// - `result()` returns `None` to continue waiting for the next update
pub trait WaitResult {
    type Output;
    /// Returns Some(output) if we should stop waiting, None if we should continue
    fn result(self) -> Option<Self::Output>;
}

// true = stop with (), false = continue waiting
impl WaitResult for bool {
    type Output = ();
    fn result(self) -> Option<Self::Output> { if self { Some(()) } else { None } }
}

// Some(value) = stop with value, None = continue waiting
impl<T> WaitResult for Option<T> {
    type Output = T;
    fn result(self) -> Option<Self::Output> { self }
}

impl<S> Wait for S
where
    S: Subscribe + Sync,
    S::Item: Send + 'static,
{
    fn wait_value(&self, target: Self::Item) -> impl Future<Output = ()> + Send
    where Self::Item: PartialEq + Send + Sync {
        self.wait_for(move |value| *value == target)
    }

    fn wait_for<F, R>(&self, predicate: F) -> impl Future<Output = R::Output> + Send
    where
        F: Fn(&Self::Item) -> R + Send,
        R: WaitResult,
    {
        // the subscription replays the current value, so no separate check is needed
        let mut changes = self.subscribe();
        async move {
            while let Some(value) = changes.next().await {
                if let Some(output) = predicate(&value).result() {
                    return output;
                }
            }
            debug!("wait_for: source ended before the predicate matched");
            std::future::pending().await
        }
    }
}
