//! `kvcoord-store`: the shared key-value store boundary.
//!
//! The coordination primitives only ever talk to a [`Store`]: a handful of
//! atomic single-key commands (strings with expiry, sorted sets, sets, lists,
//! key expiry, publish/subscribe, string compare-and-set). Two implementations:
//!
//! - [`InMemoryStore`]: process-local, clock-driven expiry, for tests/dev
//! - `RedisStore` (feature `redis`): the production backend

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;
pub mod subscription;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use store::{Store, StoreError, StoreResult};
pub use subscription::Subscription;
