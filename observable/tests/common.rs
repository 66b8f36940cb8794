use futures::{FutureExt, Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() { let _ = tracing_subscriber::fmt().with_max_level(Level::DEBUG).with_test_writer().try_init(); }

/// Everything the stream can yield without waiting
#[allow(unused)]
pub fn drain_ready<S: Stream + Unpin>(stream: &mut S) -> Vec<S::Item> {
    let mut items = Vec::new();
    while let Some(Some(item)) = stream.next().now_or_never() {
        items.push(item);
    }
    items
}

/// A change hook / listener pair that records every value it sees
#[allow(unused)]
pub fn recorder<T: Clone + Send + 'static>() -> (impl Fn(&T) + Send + Sync + 'static, Arc<Mutex<Vec<T>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = {
        let seen = seen.clone();
        move |value: &T| seen.lock().unwrap().push(value.clone())
    };
    (record, seen)
}
