//! Reentrant, TTL-aware in-process lock manager.
//!
//! All state lives in one [`LockTable`] behind a mutex, so "check if free, then
//! grant" is a single critical section per resource. Waiters queue per resource
//! in FIFO order and sleep on that resource's condition variable. Expiry timers
//! are entries in a deadline heap served by one lazily started thread; a timer
//! is cancelled by clearing the token stored on the lock entry.

use super::holder::{check_resource, AcquireOutcome, LockHandle, LockId, LockInfo, LockOptions};
use crate::error::{DenyReason, Result, StoreError};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// In-process lock manager. See the module docs.
pub struct ResourceLockManager {
    shared: Arc<Shared>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    dispose_grace: Duration,
}

struct Shared {
    table: Mutex<LockTable>,
    /// Wakes the timer thread when the heap changes.
    timer_signal: Condvar,
    /// Signalled when the last in-flight acquire leaves.
    idle: Condvar,
}

#[derive(Default)]
struct LockTable {
    disposed: bool,
    stop_timers: bool,
    slots: HashMap<String, ResourceSlot>,
    owners: HashMap<LockId, String>,
    timers: BinaryHeap<Reverse<Timer>>,
    next_ticket: u64,
    next_timer: u64,
    in_flight: usize,
}

struct ResourceSlot {
    holder: Option<HeldLock>,
    queue: VecDeque<u64>,
    signal: Arc<Condvar>,
}

impl ResourceSlot {
    fn new() -> Self {
        Self {
            holder: None,
            queue: VecDeque::new(),
            signal: Arc::new(Condvar::new()),
        }
    }
}

struct HeldLock {
    lock_id: LockId,
    holder_id: String,
    ref_count: u32,
    acquired_at: Instant,
    expires_at: Option<Instant>,
    /// Token of the live timer; anything else in the heap for this lock is stale.
    timer: Option<u64>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    deadline: Instant,
    token: u64,
    lock_id: LockId,
}

impl LockTable {
    /// Drops the holder of `resource`, wakes its waiters and forgets the slot
    /// once nobody is queued.
    fn remove_holder(&mut self, resource: &str) -> Option<HeldLock> {
        let slot = self.slots.get_mut(resource)?;
        let held = slot.holder.take()?;
        self.owners.remove(&held.lock_id);
        slot.signal.notify_all();
        if slot.queue.is_empty() {
            self.slots.remove(resource);
        }
        Some(held)
    }

    /// Removes a waiter's ticket after timeout or disposal.
    fn leave_queue(&mut self, resource: &str, ticket: u64) {
        let Some(slot) = self.slots.get_mut(resource) else {
            return;
        };
        slot.queue.retain(|t| *t != ticket);
        if slot.holder.is_none() && slot.queue.is_empty() {
            self.slots.remove(resource);
        } else {
            // the next ticket may now be at the front of a free slot
            slot.signal.notify_all();
        }
    }

    fn handle_of(&self, resource: &str) -> Option<LockHandle> {
        let held = self.slots.get(resource)?.holder.as_ref()?;
        Some(LockHandle {
            lock_id: held.lock_id.clone(),
            resource: resource.to_string(),
            holder_id: held.holder_id.clone(),
            expires_at: held.expires_at,
        })
    }

    fn fire(&mut self, timer: Timer) {
        let Some(resource) = self.owners.get(&timer.lock_id).cloned() else {
            return;
        };
        let Some(held) = self
            .slots
            .get_mut(&resource)
            .and_then(|slot| slot.holder.as_mut())
        else {
            return;
        };
        if held.lock_id != timer.lock_id || held.timer != Some(timer.token) {
            return;
        }
        held.timer = None;
        if held.ref_count > 1 {
            debug!(
                resource = %resource,
                ref_count = held.ref_count,
                "lock ttl elapsed with reentrant holds outstanding, not expiring"
            );
            return;
        }
        self.remove_holder(&resource);
        debug!(resource = %resource, lock_id = %timer.lock_id, "lock expired");
    }
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ResourceLockManager {
    /// Creates a manager. `dispose_grace` bounds how long `dispose()` waits for
    /// in-flight acquires to unwind.
    pub fn new(dispose_grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(LockTable::default()),
                timer_signal: Condvar::new(),
                idle: Condvar::new(),
            }),
            timer_thread: Mutex::new(None),
            dispose_grace,
        }
    }

    /// Tries to acquire `resource`.
    ///
    /// Contention never errors: the outcome says whether the lock was granted
    /// and, if not, why.
    ///
    /// # Errors
    ///
    /// Returns `EmptyResource` for a blank key, or `Io` if the timer thread
    /// cannot be started.
    pub fn acquire(&self, resource: &str, options: &LockOptions) -> Result<AcquireOutcome> {
        check_resource(resource)?;
        let holder_id = options
            .holder_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut table = self.shared.table.lock();
        if table.disposed {
            return Ok(AcquireOutcome::NotAcquired(DenyReason::Disposed));
        }

        table.in_flight += 1;
        let outcome = self.acquire_locked(&mut table, resource, &holder_id, options);
        table.in_flight -= 1;
        if table.in_flight == 0 {
            self.shared.idle.notify_all();
        }
        outcome
    }

    fn acquire_locked(
        &self,
        table: &mut parking_lot::MutexGuard<'_, LockTable>,
        resource: &str,
        holder_id: &str,
        options: &LockOptions,
    ) -> Result<AcquireOutcome> {
        let ttl = options.effective_ttl();

        if options.reentrant {
            if let Some(handle) = self.reenter(table, resource, holder_id, ttl)? {
                return Ok(AcquireOutcome::Acquired(handle));
            }
        }

        let free = table
            .slots
            .get(resource)
            .map_or(true, |slot| slot.holder.is_none() && slot.queue.is_empty());
        if free {
            return self
                .grant(table, resource, holder_id, ttl)
                .map(AcquireOutcome::Acquired);
        }

        if options.acquire_timeout.is_zero() {
            return Ok(AcquireOutcome::NotAcquired(DenyReason::Timeout {
                waited: Duration::ZERO,
            }));
        }

        let deadline = Instant::now() + options.acquire_timeout;
        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let signal = {
            let slot = table
                .slots
                .entry(resource.to_string())
                .or_insert_with(ResourceSlot::new);
            slot.queue.push_back(ticket);
            Arc::clone(&slot.signal)
        };
        debug!(resource, holder_id, ticket, "waiting for lock");

        loop {
            let timed_out = signal.wait_until(table, deadline).timed_out();

            if table.disposed {
                table.leave_queue(resource, ticket);
                return Ok(AcquireOutcome::NotAcquired(DenyReason::Disposed));
            }

            let my_turn = table
                .slots
                .get(resource)
                .map_or(false, |slot| {
                    slot.holder.is_none() && slot.queue.front() == Some(&ticket)
                });
            if my_turn {
                if let Some(slot) = table.slots.get_mut(resource) {
                    slot.queue.pop_front();
                }
                return self
                    .grant(table, resource, holder_id, ttl)
                    .map(AcquireOutcome::Acquired);
            }

            if timed_out || Instant::now() >= deadline {
                table.leave_queue(resource, ticket);
                debug!(resource, holder_id, "lock wait timed out");
                return Ok(AcquireOutcome::NotAcquired(DenyReason::Timeout {
                    waited: options.acquire_timeout,
                }));
            }
        }
    }

    /// Reentrant fast path: bumps the ref count when `holder_id` already holds
    /// the resource. The expiry only ever moves later.
    fn reenter(
        &self,
        table: &mut LockTable,
        resource: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockHandle>> {
        let current_expiry = match table
            .slots
            .get(resource)
            .and_then(|slot| slot.holder.as_ref())
        {
            Some(held) if held.holder_id == holder_id => held.expires_at,
            _ => return Ok(None),
        };

        // A lock without expiry never gets one through re-entry.
        let extend_to = match (ttl, current_expiry) {
            (Some(ttl), Some(current)) => {
                let candidate = Instant::now() + ttl;
                (candidate > current).then_some(candidate)
            }
            _ => None,
        };
        let token = match extend_to {
            Some(deadline) => {
                let lock_id = table
                    .slots
                    .get(resource)
                    .and_then(|slot| slot.holder.as_ref())
                    .map(|held| held.lock_id.clone());
                match lock_id {
                    Some(lock_id) => Some(self.schedule(table, lock_id, deadline)?),
                    None => None,
                }
            }
            None => None,
        };

        let Some(held) = table
            .slots
            .get_mut(resource)
            .and_then(|slot| slot.holder.as_mut())
        else {
            return Ok(None);
        };
        held.ref_count += 1;
        if let (Some(deadline), Some(token)) = (extend_to, token) {
            held.expires_at = Some(deadline);
            held.timer = Some(token);
        }
        debug!(resource, holder_id, ref_count = held.ref_count, "lock re-entered");
        Ok(table.handle_of(resource))
    }

    fn grant(
        &self,
        table: &mut LockTable,
        resource: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> Result<LockHandle> {
        let lock_id = LockId::generate();
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let timer = match expires_at {
            Some(deadline) => Some(self.schedule(table, lock_id.clone(), deadline)?),
            None => None,
        };

        let slot = table
            .slots
            .entry(resource.to_string())
            .or_insert_with(ResourceSlot::new);
        slot.holder = Some(HeldLock {
            lock_id: lock_id.clone(),
            holder_id: holder_id.to_string(),
            ref_count: 1,
            acquired_at: now,
            expires_at,
            timer,
        });
        table.owners.insert(lock_id.clone(), resource.to_string());
        debug!(resource, holder_id, lock_id = %lock_id, "lock acquired");

        Ok(LockHandle {
            lock_id,
            resource: resource.to_string(),
            holder_id: holder_id.to_string(),
            expires_at,
        })
    }

    /// Pushes a timer and returns its token. Starts the timer thread on first use.
    fn schedule(&self, table: &mut LockTable, lock_id: LockId, deadline: Instant) -> Result<u64> {
        self.ensure_timer_thread()?;
        let token = table.next_timer;
        table.next_timer += 1;
        table.timers.push(Reverse(Timer {
            deadline,
            token,
            lock_id,
        }));
        self.shared.timer_signal.notify_all();
        Ok(token)
    }

    fn ensure_timer_thread(&self) -> Result<()> {
        let mut slot = self.timer_thread.lock();
        if slot.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("plandoc-lock-timers".to_string())
                .spawn(move || run_timers(shared))?;
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Releases one hold on `lock_id`. The resource is freed when the last
    /// reentrant hold is released.
    ///
    /// # Errors
    ///
    /// Returns `UnknownLock` if the id is not held. After `dispose()` this is
    /// a no-op so release-on-cleanup paths stay safe.
    pub fn release(&self, lock_id: &LockId) -> Result<()> {
        let mut table = self.shared.table.lock();
        if table.disposed {
            return Ok(());
        }

        let resource = table
            .owners
            .get(lock_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))?;
        let held = table
            .slots
            .get_mut(&resource)
            .and_then(|slot| slot.holder.as_mut())
            .filter(|held| held.lock_id == *lock_id)
            .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))?;

        if held.ref_count > 1 {
            held.ref_count -= 1;
            debug!(resource = %resource, ref_count = held.ref_count, "reentrant hold released");
            return Ok(());
        }

        table.remove_holder(&resource);
        debug!(resource = %resource, lock_id = %lock_id, "lock released");
        Ok(())
    }

    /// Replaces the expiry of a held lock without touching its ref count.
    /// A zero `ttl` removes the expiry.
    ///
    /// # Errors
    ///
    /// Returns `UnknownLock` if the lock is no longer held, so a released lock
    /// can never be revived.
    pub fn extend(&self, lock_id: &LockId, ttl: Duration) -> Result<LockHandle> {
        let mut table = self.shared.table.lock();
        let resource = table
            .owners
            .get(lock_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))?;

        let (expires_at, token) = if ttl.is_zero() {
            (None, None)
        } else {
            let deadline = Instant::now() + ttl;
            let token = self.schedule(&mut table, lock_id.clone(), deadline)?;
            (Some(deadline), Some(token))
        };

        let held = table
            .slots
            .get_mut(&resource)
            .and_then(|slot| slot.holder.as_mut())
            .filter(|held| held.lock_id == *lock_id)
            .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))?;
        held.expires_at = expires_at;
        held.timer = token;
        debug!(resource = %resource, ttl_ms = ttl.as_millis() as u64, "lock extended");

        table
            .handle_of(&resource)
            .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))
    }

    /// Runs `f` while holding `resource`. The lock is released on every exit
    /// path, including errors and panics.
    ///
    /// # Errors
    ///
    /// Returns `LockUnavailable` if the lock could not be taken (timeout or
    /// disposal); otherwise whatever `f` returns.
    pub fn with_lock<T, F>(&self, resource: &str, options: &LockOptions, f: F) -> Result<T>
    where
        F: FnOnce(&LockHandle) -> Result<T>,
    {
        let handle = self.acquire(resource, options)?.into_result(resource)?;
        let _guard = ReleaseGuard {
            manager: self,
            lock_id: handle.lock_id.clone(),
            resource: handle.resource.clone(),
        };
        f(&handle)
    }

    /// True while any holder owns `resource`.
    pub fn is_locked(&self, resource: &str) -> bool {
        self.shared
            .table
            .lock()
            .slots
            .get(resource)
            .map_or(false, |slot| slot.holder.is_some())
    }

    /// Describes the current holder of `resource`.
    pub fn get_lock_holder(&self, resource: &str) -> Option<LockInfo> {
        let table = self.shared.table.lock();
        let held = table.slots.get(resource)?.holder.as_ref()?;
        Some(LockInfo {
            lock_id: held.lock_id.clone(),
            resource: resource.to_string(),
            holder_id: held.holder_id.clone(),
            ref_count: held.ref_count,
            acquired_at: held.acquired_at,
            expires_at: held.expires_at,
        })
    }

    /// Number of resources currently held.
    pub fn active_locks(&self) -> usize {
        self.shared.table.lock().owners.len()
    }

    /// True once `dispose()` has run.
    pub fn is_disposed(&self) -> bool {
        self.shared.table.lock().disposed
    }

    /// Shuts the manager down: rejects new acquires, drops every hold, wakes
    /// all waiters with `Disposed`, then stops the timer thread. Idempotent.
    pub fn dispose(&self) {
        let mut table = self.shared.table.lock();
        if table.disposed {
            return;
        }
        table.disposed = true;

        let released = table.owners.len();
        table.owners.clear();
        for slot in table.slots.values_mut() {
            slot.holder = None;
            slot.signal.notify_all();
        }

        let deadline = Instant::now() + self.dispose_grace;
        while table.in_flight > 0 {
            if self.shared.idle.wait_until(&mut table, deadline).timed_out() {
                warn!(
                    in_flight = table.in_flight,
                    "acquires still in flight after dispose grace period"
                );
                break;
            }
        }

        table.slots.clear();
        table.timers.clear();
        table.stop_timers = true;
        self.shared.timer_signal.notify_all();
        drop(table);

        if let Some(handle) = self.timer_thread.lock().take() {
            if handle.join().is_err() {
                warn!("lock timer thread panicked");
            }
        }
        info!(released, "resource lock manager disposed");
    }
}

impl Drop for ResourceLockManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_timers(shared: Arc<Shared>) {
    let mut table = shared.table.lock();
    loop {
        if table.stop_timers {
            break;
        }
        match table.timers.peek().map(|Reverse(timer)| timer.deadline) {
            None => shared.timer_signal.wait(&mut table),
            Some(deadline) if deadline > Instant::now() => {
                shared.timer_signal.wait_until(&mut table, deadline);
            }
            Some(_) => {
                if let Some(Reverse(timer)) = table.timers.pop() {
                    table.fire(timer);
                }
            }
        }
    }
}

/// Releases a scoped lock on drop.
struct ReleaseGuard<'a> {
    manager: &'a ResourceLockManager,
    lock_id: LockId,
    resource: String,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.lock_id) {
            warn!(
                resource = %self.resource,
                lock_id = %self.lock_id,
                error = %e,
                "scoped lock was already gone at release (expired?)"
            );
        }
    }
}
