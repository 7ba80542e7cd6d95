//! Graduated error recovery.
//!
//! Failures are captured as [`ErrorState`] records keyed by workflow id,
//! classified as transient or permanent, and walked up a three-rung ladder
//! that ends with a human being notified.

mod classify;
mod ladder;
mod locks;
mod state;
mod store;

pub use classify::is_temporary;
pub use ladder::{ErrorRecovery, MAX_RETRY_ATTEMPTS};
pub use locks::KeyedLocks;
pub use state::{ErrorContext, ErrorState, RecoveryResult, RecoveryStrategy};
pub use store::{ErrorStateStore, FileErrorStore, MemoryErrorStore, StoreError};
