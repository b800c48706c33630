pub mod snapshot;
pub mod store;

// Re-export main types for convenience
pub use snapshot::{SnapshotEntry, SnapshotError, EMPTY_SNAPSHOT};
pub use store::{Store, StoredEntry};
