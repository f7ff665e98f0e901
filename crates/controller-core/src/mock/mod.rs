//! In-memory backends for testing controllers without a cluster.
//!
//! - [`FakeListerWatcher`] stands in for the API server's list/watch
//!   endpoints. Tests mutate it directly and can inject list failures,
//!   expired resource versions and dropped connections.
//! - [`MemoryLeaseLock`] stands in for the Lease object. Several candidates
//!   share one slot, and the slot can be made unreachable or taken over.
//!
//! Available under `cfg(test)` and with the `test-util` feature.

mod lease;
mod source;

pub use lease::MemoryLeaseLock;
pub use source::FakeListerWatcher;
