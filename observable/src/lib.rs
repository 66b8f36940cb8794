/*!
A thread-safe observable value for ankurah

An [`Observable`] holds one canonical value behind a short, non-async lock and lets any
number of tasks watch it change through independent, cancellable async
[`Subscription`]s. A UI-bound [`Mirror`] can be kept in sync in both directions
without the two sides echoing writes back at each other.

# Guarantees
- A new subscription's first item is the value current at the moment it registered
- Every subscriber sees writes in the order they were applied, never the same write twice
- Dropping a subscription (or aborting the task that owns it) deregisters it
- `mutate` is atomic; so are `update` transforms
- Mirror writes run on the mirror's own [`Dispatch`] context and may lag the canonical value

# Basic usage

```rust
use ankurah_observable::*;
use futures::StreamExt;

# futures::executor::block_on(async {
let status = Observable::new("idle".to_string());
let mut changes = status.subscribe();
assert_eq!(changes.next().await.as_deref(), Some("idle"));

status.set("busy".to_string());
assert_eq!(changes.next().await.as_deref(), Some("busy"));

drop(changes);
assert_eq!(status.subscriber_count(), 0);
# });
```

# Mirror usage

```rust
use ankurah_observable::*;

let value = Observable::builder(1).mirror_on(Inline).build();
let mirror = value.mirror().unwrap();

value.set(2); // pushed to the mirror on its dispatch context
assert_eq!(mirror.get(), 2);

mirror.set(3); // a UI write flows back into the canonical value
assert_eq!(value.get(), 3);
```

# Optional values

```rust
use ankurah_observable::*;
use futures::{FutureExt, StreamExt};

let selected = ObservableOption::<u32>::new(None);
let mut picks = selected.subscribe();
selected.set(Some(4));
selected.clear();
assert_eq!(picks.next().now_or_never(), Some(Some(4)));
assert_eq!(picks.next().now_or_never(), None);
```
*/

mod broadcast;
mod mirror;
mod observable;
mod optional;
mod porcelain;
mod stream;
mod value;

#[cfg(feature = "persist")]
mod error;
#[cfg(feature = "persist")]
pub mod persist;

pub use broadcast::*;
pub use mirror::*;
pub use observable::*;
pub use optional::*;
pub use porcelain::*;
pub use stream::*;
pub use value::*;

#[cfg(feature = "persist")]
pub use error::*;
