//! blockstream-storage: storage backends for Blockstream.
//!
//! Backends:
//! - [`memory`]: in-memory blocks + state (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx`: state record, block store, and a durable
//!   queue with visibility timeouts ([`queue`])

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use queue::SqliteQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
