//! Lock managers.
//!
//! [`ResourceLockManager`] coordinates threads inside one process;
//! [`FileLockManager`] coordinates processes sharing a store root. Both hand
//! out [`LockHandle`]s and report contention as an [`AcquireOutcome`].

mod file;
mod holder;
mod resource;

pub use file::{FileLockManager, SweepReport};
pub use holder::{AcquireOutcome, LockHandle, LockId, LockInfo, LockOptions};
pub use resource::ResourceLockManager;
