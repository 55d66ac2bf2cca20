//! Encrypted server-side sessions and the per-session refresh lock.

pub mod crypto;
pub mod lock;
pub mod store;
pub mod types;

pub use lock::{DistributedLock, LockGuard, LockHandle};
pub use store::SessionStore;
pub use types::{SessionId, SessionRecord};
