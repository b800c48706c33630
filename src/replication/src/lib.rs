pub mod primary;
pub mod replica;

// Re-exports for convenience
pub use primary::Primary;
pub use replica::{Replica, ReplicationError};
