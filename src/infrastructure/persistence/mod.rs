//! Session persistence: the shared store, the routing table on top of it
//! and the in-process session map

#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod router;
pub mod session_store;
pub mod store;

#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use router::{DistributedRouter, SessionRecord};
pub use session_store::SessionStore;
pub use store::{MemoryStore, SharedStore, StoreError, StoreResult};
