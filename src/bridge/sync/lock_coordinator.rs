//! Per-entity exclusive locks.
//!
//! Each entity gets a slot holding a single-permit FIFO semaphore and a record of the current
//! holder. Acquisition waits in arrival order up to a timeout; ownership is a `LockTicket` so a
//! release from anyone but the holder is a no-op. The stale sweep only compares timestamps and
//! never waits on the semaphores it inspects.
//!
//! Retiring an entity leaves a tombstone: further acquisitions fail without recreating the slot
//! until the entity is readmitted on its next connect.

use crate::bridge::sync::state_tracker::SyncStateTracker;
use crate::bridge::types::{EntityId, SyncState};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Proof of lock ownership handed out by `LockCoordinator::acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTicket(u64);

#[derive(Debug, Clone, Copy)]
struct Holder {
    ticket: LockTicket,
    acquired_at: Instant,
}

#[derive(Debug)]
struct LockSlot {
    permits: Semaphore,
    holder: Mutex<Option<Holder>>,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
            holder: Mutex::new(None),
        }
    }
}

/// Process-wide registry of entity locks.
pub struct LockCoordinator {
    slots: DashMap<EntityId, Arc<LockSlot>>,
    retired: DashMap<EntityId, ()>,
    states: Arc<SyncStateTracker>,
    next_ticket: AtomicU64,
}

impl LockCoordinator {
    pub fn new(states: Arc<SyncStateTracker>) -> Self {
        Self {
            slots: DashMap::new(),
            retired: DashMap::new(),
            states,
            next_ticket: AtomicU64::new(1),
        }
    }

    fn slot(&self, id: EntityId) -> Arc<LockSlot> {
        self.slots
            .entry(id)
            .or_insert_with(|| Arc::new(LockSlot::new()))
            .clone()
    }

    fn existing_slot(&self, id: EntityId) -> Option<Arc<LockSlot>> {
        self.slots.get(&id).map(|slot| Arc::clone(&slot))
    }

    /// Wait up to `timeout` for the entity's lock.
    ///
    /// Waiters are served first come, first served. Returns `None` on timeout, when the entity is
    /// retired, or when the slot was retired by cleanup while waiting.
    pub async fn acquire(&self, id: EntityId, timeout: Duration) -> Option<LockTicket> {
        if self.is_retired(id) {
            debug!("Refusing lock for retired entity {}", id);
            return None;
        }
        let slot = self.slot(id);
        // A retire may have landed between the check and the slot insert
        if self.is_retired(id) {
            self.slots.remove_if(&id, |_, current| Arc::ptr_eq(current, &slot));
            return None;
        }
        match tokio::time::timeout(timeout, slot.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let ticket = LockTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
                *slot.holder.lock() = Some(Holder {
                    ticket,
                    acquired_at: Instant::now(),
                });
                debug!("Entity {} locked ({:?})", id, ticket);
                Some(ticket)
            }
            Ok(Err(_)) => {
                debug!("Lock for {} was retired while waiting", id);
                None
            }
            Err(_) => {
                debug!("Failed to acquire lock for {} within {:?}", id, timeout);
                None
            }
        }
    }

    /// Release the lock if `ticket` still owns it. Returns whether anything was released.
    pub fn release(&self, id: EntityId, ticket: LockTicket) -> bool {
        self.release_inner(id, ticket, None)
    }

    /// Release the lock, publishing `state` while ownership is still held.
    ///
    /// The state write is skipped when `ticket` no longer owns the lock, so a protocol whose lock
    /// was force-released cannot clobber the state of the next holder.
    pub fn release_with_state(&self, id: EntityId, ticket: LockTicket, state: SyncState) -> bool {
        self.release_inner(id, ticket, Some(state))
    }

    fn release_inner(&self, id: EntityId, ticket: LockTicket, state: Option<SyncState>) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            debug!("Ignoring release of {}: no lock registered", id);
            return false;
        };

        let mut holder = slot.holder.lock();
        let current = *holder;
        match current {
            Some(current) if current.ticket == ticket => {
                if let Some(state) = state {
                    self.states.set_state(id, state);
                }
                *holder = None;
                drop(holder);
                slot.permits.add_permits(1);
                debug!("Entity {} unlocked ({:?})", id, ticket);
                true
            }
            _ => {
                debug!("Ignoring release of {} by non-holder {:?}", id, ticket);
                false
            }
        }
    }

    /// Clear ownership unconditionally and reset the entity to `Idle`.
    ///
    /// Reserved for stale-lock recovery; normal protocol paths always use `release`.
    pub fn force_release(&self, id: EntityId) {
        self.force_release_inner(id, None);
    }

    fn force_release_inner(&self, id: EntityId, only: Option<LockTicket>) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            debug!("Ignoring force release of {}: no lock registered", id);
            return false;
        };

        let mut holder = slot.holder.lock();
        if let Some(expected) = only {
            if holder.map(|current| current.ticket) != Some(expected) {
                return false;
            }
        }
        let released = holder.take().is_some();
        self.states.set_state(id, SyncState::Idle);
        drop(holder);

        if released {
            slot.permits.add_permits(1);
        }
        debug!("Force unlocked {}", id);
        released
    }

    /// Force-release every lock held for longer than `stale_after` as of `now`.
    ///
    /// Returns the recovered entities.
    pub fn sweep_stale(&self, now: Instant, stale_after: Duration) -> Vec<EntityId> {
        let stale: Vec<(EntityId, LockTicket)> = self
            .slots
            .iter()
            .filter_map(|entry| {
                let holder = *entry.value().holder.lock();
                holder
                    .filter(|h| now.saturating_duration_since(h.acquired_at) > stale_after)
                    .map(|h| (*entry.key(), h.ticket))
            })
            .collect();

        stale
            .into_iter()
            .filter_map(|(id, ticket)| {
                if self.force_release_inner(id, Some(ticket)) {
                    warn!("Detected stale lock for {}, force released", id);
                    Some(id)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn is_locked(&self, id: EntityId) -> bool {
        self.existing_slot(id)
            .map(|slot| slot.holder.lock().is_some())
            .unwrap_or(false)
    }

    /// How long the current holder has owned the lock.
    pub fn holder_age(&self, id: EntityId) -> Option<Duration> {
        self.existing_slot(id)
            .and_then(|slot| *slot.holder.lock())
            .map(|holder| holder.acquired_at.elapsed())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Drop the entity's slot and tombstone it; protocols still queued on it, or arriving later,
    /// give up instead of acquiring.
    pub fn retire(&self, id: EntityId) {
        self.retired.insert(id, ());
        if let Some((_, slot)) = self.slots.remove(&id) {
            slot.holder.lock().take();
            slot.permits.close();
            debug!("Retired lock slot for {}", id);
        }
    }

    /// Lift the tombstone left by `retire`. Returns whether the entity was retired.
    pub fn readmit(&self, id: EntityId) -> bool {
        self.retired.remove(&id).is_some()
    }

    pub fn is_retired(&self, id: EntityId) -> bool {
        self.retired.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> (Arc<SyncStateTracker>, Arc<LockCoordinator>) {
        let states = Arc::new(SyncStateTracker::new());
        let locks = Arc::new(LockCoordinator::new(states.clone()));
        (states, locks)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let (_, locks) = coordinator();
        let id = EntityId::new_v4();

        let ticket = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        assert!(locks.is_locked(id));
        assert!(locks.holder_age(id).is_some());

        // Contended acquire times out instead of failing loudly
        assert!(locks.acquire(id, Duration::from_millis(20)).await.is_none());

        assert!(locks.release(id, ticket));
        assert!(!locks.is_locked(id));
        assert!(locks.acquire(id, Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn double_release_is_noop() {
        let (_, locks) = coordinator();
        let id = EntityId::new_v4();

        let first = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        assert!(locks.release(id, first));
        let second = locks.acquire(id, Duration::from_millis(50)).await.unwrap();

        // Stale ticket must not free the new holder
        assert!(!locks.release(id, first));
        assert!(locks.is_locked(id));
        assert!(locks.release(id, second));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let (_, locks) = coordinator();
        let id = EntityId::new_v4();
        let first = locks.acquire(id, Duration::from_millis(50)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let ticket = locks.acquire(id, Duration::from_secs(5)).await.unwrap();
                order.lock().push(i);
                locks.release(id, ticket);
            }));
            // Let each waiter enqueue before the next one arrives
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        locks.release(id, first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_two_holders() {
        let (_, locks) = coordinator();
        let id = EntityId::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let ticket = locks.acquire(id, Duration::from_secs(10)).await.unwrap();
                let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now_inside, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locks.release(id, ticket);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweep_recovers_stale_lock() {
        let (states, locks) = coordinator();
        let id = EntityId::new_v4();
        let fresh = EntityId::new_v4();

        let ticket = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        states.set_state(id, SyncState::Saving);
        locks.acquire(fresh, Duration::from_millis(50)).await.unwrap();

        // Nothing is stale yet
        assert!(locks.sweep_stale(Instant::now(), Duration::from_secs(30)).is_empty());

        // As if both locks had been taken 31 s ago; only a 30 s threshold applies to both
        let later = Instant::now() + Duration::from_millis(31_000);
        let mut recovered = locks.sweep_stale(later, Duration::from_secs(30));
        recovered.sort();
        let mut expected = vec![id, fresh];
        expected.sort();
        assert_eq!(recovered, expected);

        assert!(!locks.is_locked(id));
        assert_eq!(states.get_state(id), SyncState::Idle);

        // The hung holder's late release must not disturb whoever comes next
        let next = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        assert!(!locks.release(id, ticket));
        assert!(locks.is_locked(id));
        assert!(locks.release(id, next));
    }

    #[tokio::test]
    async fn release_with_state_skipped_after_force_release() {
        let (states, locks) = coordinator();
        let id = EntityId::new_v4();

        let ticket = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        locks.force_release(id);
        let next = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        states.set_state(id, SyncState::Loading);

        assert!(!locks.release_with_state(id, ticket, SyncState::Idle));
        assert_eq!(states.get_state(id), SyncState::Loading);
        assert!(locks.release_with_state(id, next, SyncState::Idle));
        assert_eq!(states.get_state(id), SyncState::Idle);
    }

    #[tokio::test]
    async fn retire_wakes_waiters() {
        let (_, locks) = coordinator();
        let id = EntityId::new_v4();
        locks.acquire(id, Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(id, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        locks.retire(id);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should give up promptly")
            .unwrap();
        assert!(result.is_none());
        assert!(!locks.contains(id));
    }

    #[tokio::test]
    async fn retired_entity_stays_locked_out_until_readmitted() {
        let (states, locks) = coordinator();
        let id = EntityId::new_v4();
        locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        locks.retire(id);

        assert!(locks.acquire(id, Duration::from_millis(50)).await.is_none());
        assert!(!locks.contains(id));
        assert!(!states.contains(id));

        assert!(locks.readmit(id));
        assert!(!locks.readmit(id));
        let ticket = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        assert!(locks.release(id, ticket));
    }

    #[test]
    fn force_release_of_unknown_entity_leaves_no_trace() {
        let (states, locks) = coordinator();
        let id = EntityId::new_v4();

        locks.force_release(id);
        assert!(!states.contains(id));
        assert!(!locks.contains(id));
    }
}
