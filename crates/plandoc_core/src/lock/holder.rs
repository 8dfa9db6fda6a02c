//! Types shared by the in-process and cross-process lock managers.

use crate::error::{DenyReason, Result, StoreError};
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of one granted lock. Reentrant re-acquisitions share the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(String);

impl LockId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acquisition options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Auto-release after this long; `None` or zero never expires.
    pub ttl: Option<Duration>,
    /// Zero tries once; otherwise waits up to this long.
    pub acquire_timeout: Duration,
    /// Logical holder; a fresh id is generated when absent.
    pub holder_id: Option<String>,
    /// Allow the same holder to acquire again without blocking.
    pub reentrant: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            acquire_timeout: Duration::from_secs(5),
            holder_id: None,
            reentrant: false,
        }
    }
}

impl LockOptions {
    /// Try once, never wait.
    pub fn try_once() -> Self {
        Self::default().timeout(Duration::ZERO)
    }

    /// Sets the acquire timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the holder id.
    pub fn holder(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    /// Marks the acquisition as reentrant.
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// TTL with zero folded into `None`.
    pub(crate) fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Lock identity, used for release and extend.
    pub lock_id: LockId,
    /// Resource key.
    pub resource: String,
    /// Logical holder.
    pub holder_id: String,
    /// Current expiry, if any.
    pub expires_at: Option<Instant>,
}

/// Result of an acquire attempt. Contention is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock is held by the caller.
    Acquired(LockHandle),
    /// The lock could not be taken.
    NotAcquired(DenyReason),
}

impl AcquireOutcome {
    /// True for `Acquired`.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// The handle, if acquired.
    pub fn handle(&self) -> Option<&LockHandle> {
        match self {
            Self::Acquired(h) => Some(h),
            Self::NotAcquired(_) => None,
        }
    }

    /// Turns a denial into `LockUnavailable` for callers that cannot proceed.
    pub fn into_result(self, resource: &str) -> Result<LockHandle> {
        match self {
            Self::Acquired(h) => Ok(h),
            Self::NotAcquired(reason) => Err(StoreError::LockUnavailable {
                resource: resource.to_string(),
                reason,
            }),
        }
    }
}

/// Snapshot of a held lock, as reported by `get_lock_holder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock identity.
    pub lock_id: LockId,
    /// Resource key.
    pub resource: String,
    /// Logical holder.
    pub holder_id: String,
    /// Outstanding acquisitions (at least 1).
    pub ref_count: u32,
    /// When the lock was first granted.
    pub acquired_at: Instant,
    /// Current expiry, if any.
    pub expires_at: Option<Instant>,
}

pub(crate) fn check_resource(resource: &str) -> Result<()> {
    if resource.trim().is_empty() {
        return Err(StoreError::EmptyResource);
    }
    Ok(())
}
