//! The promise store: identity, memory caching, persistence, re-hydration.
//!
//! The store owns the mapping from [`PromiseId`] to live promise objects.
//! An incomplete promise is strongly retained — it must always have a live
//! in-memory representation. The moment a promise completes, its outcome is
//! serialized and written to the blob store, and the live reference is
//! demoted to a weak one so the object can be dropped once every external
//! holder lets go. A later `get_by_id` rematerializes it from disk.
//!
//! A completed promise is never left with neither a live representation nor
//! a persisted blob: persistence failures and oversize payloads keep the
//! strong reference.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::blob::{decode_outcome, encode_outcome, SchemaRegistry};
use crate::error::SluiceError;
use crate::promise::{Promise, PromiseId, PromiseOutcome, PromisePayload};
use crate::storage::BlobStore;

/// How many create/get operations pass between opportunistic sweeps of dead
/// weak handles.
const SWEEP_INTERVAL: u64 = 64;

enum LiveRef {
    /// Incomplete (or completed but unpersistable): the store keeps the
    /// object alive.
    Strong(Arc<Promise>),
    /// Completed and persisted: the object may be dropped and rebuilt from
    /// the blob store on demand.
    Weak(Weak<Promise>),
}

impl LiveRef {
    fn upgrade(&self) -> Option<Arc<Promise>> {
        match self {
            LiveRef::Strong(promise) => Some(promise.clone()),
            LiveRef::Weak(weak) => weak.upgrade(),
        }
    }
}

/// A retention deadline for one promise. The derived ordering (deadline
/// first) makes `Reverse<ExpiryAt>` a min-heap entry.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryAt {
    due: Instant,
    id: PromiseId,
}

/// Read-only view of the live map, for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Strongly retained promises (incomplete or memory-pinned).
    pub strong: usize,
    /// Weak slots whose promise is still alive somewhere.
    pub weak_live: usize,
    /// Weak slots waiting to be swept.
    pub weak_dead: usize,
}

/// Identity and lifecycle authority for promises.
pub struct PromiseStore {
    service_id: u32,
    next_sequence: AtomicU64,
    live: DashMap<PromiseId, LiveRef>,
    blobs: Arc<dyn BlobStore>,
    schemas: Arc<SchemaRegistry>,
    op_tick: AtomicU64,
    expirations: Mutex<BinaryHeap<Reverse<ExpiryAt>>>,
}

impl PromiseStore {
    pub fn new(
        service_id: u32,
        blobs: Arc<dyn BlobStore>,
        schemas: Arc<SchemaRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            next_sequence: AtomicU64::new(1),
            live: DashMap::new(),
            blobs,
            schemas,
            op_tick: AtomicU64::new(0),
            expirations: Mutex::new(BinaryHeap::new()),
        })
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Mint a fresh promise and register it.
    ///
    /// The store subscribes its own completion handler before any caller can
    /// complete the promise, so the persist-and-demote transition always
    /// runs. Passing an `outcome` completes the promise immediately — and,
    /// if it is small enough, persists it in the same call.
    pub fn create(
        self: &Arc<Self>,
        input: Option<PromisePayload>,
        outcome: Option<PromiseOutcome>,
    ) -> Arc<Promise> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = PromiseId::new(self.service_id, sequence);
        let promise = Promise::new(id, input);

        self.live
            .insert(id, LiveRef::Strong(promise.clone()));
        self.attach_completion_handler(&promise);

        if let Some(outcome) = outcome {
            promise.try_complete(outcome);
        }

        self.maybe_sweep();
        promise
    }

    /// Look up a promise by id, rematerializing from the blob store when the
    /// live object is gone.
    pub fn get_by_id(self: &Arc<Self>, id: PromiseId) -> Option<Arc<Promise>> {
        self.maybe_sweep();

        // Fast path: live map. The guard must be dropped before any insert
        // below, or the shard lock would deadlock against ourselves.
        if let Some(found) = self.live.get(&id).and_then(|entry| entry.upgrade()) {
            return Some(found);
        }

        let value = match self.blobs.get(id) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(promise_id = %id, error = %e, "blob read failed; treating as a miss");
                return None;
            }
        };
        let outcome = match decode_outcome(&value, &self.schemas) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(promise_id = %id, error = %e, "blob decode failed; treating as a miss");
                return None;
            }
        };
        let rebuilt = Promise::rehydrated(id, outcome);

        // Another thread may have rematerialized concurrently; whoever got
        // a live object in first wins so all callers share one instance.
        match self.live.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if let Some(existing) = occupied.get().upgrade() {
                    return Some(existing);
                }
                occupied.insert(LiveRef::Weak(Arc::downgrade(&rebuilt)));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LiveRef::Weak(Arc::downgrade(&rebuilt)));
            }
        }
        Some(rebuilt)
    }

    /// Schedule the promise to be forgotten `when` from now.
    ///
    /// Retention ends at the deadline: a *completed* promise's blob record
    /// and live-map slot are dropped, so later lookups miss. A promise that
    /// is still incomplete when its deadline arrives must keep its live
    /// representation, so its expiry lapses. Deadlines are drained on the
    /// same opportunistic cadence as the weak-slot sweep.
    pub fn schedule_promise_expiry(&self, promise: &Arc<Promise>, when: Duration) {
        let due = Instant::now() + when;
        self.expirations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse(ExpiryAt {
                due,
                id: promise.id(),
            }));
        debug!(promise_id = %promise.id(), after = ?when, "promise expiry scheduled");
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.live.iter() {
            match entry.value() {
                LiveRef::Strong(_) => stats.strong += 1,
                LiveRef::Weak(weak) if weak.strong_count() > 0 => stats.weak_live += 1,
                LiveRef::Weak(_) => stats.weak_dead += 1,
            }
        }
        stats
    }

    /// Opportunistic housekeeping, driven by create/get traffic: due
    /// retention deadlines fire on every operation (a cheap peek), dead
    /// weak slots are swept on a rate-limited tick.
    fn maybe_sweep(&self) {
        self.drain_due_expirations();

        let tick = self.op_tick.fetch_add(1, Ordering::Relaxed);
        if tick % SWEEP_INTERVAL != SWEEP_INTERVAL - 1 {
            return;
        }
        self.live.retain(|_, entry| match entry {
            LiveRef::Strong(_) => true,
            LiveRef::Weak(weak) => weak.strong_count() > 0,
        });
    }

    fn drain_due_expirations(&self) {
        let now = Instant::now();
        loop {
            let due_id = {
                let mut deadlines = self
                    .expirations
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match deadlines.peek() {
                    Some(Reverse(entry)) if entry.due <= now => {
                        deadlines.pop().map(|Reverse(entry)| entry.id)
                    }
                    _ => return,
                }
            };
            if let Some(id) = due_id {
                self.expire_promise(id);
            }
        }
    }

    fn expire_promise(&self, id: PromiseId) {
        if let Some(live) = self.live.get(&id).and_then(|entry| entry.upgrade()) {
            if !live.is_complete() {
                // An incomplete promise always keeps its live
                // representation; the retention deadline lapses.
                debug!(promise_id = %id, "expiry lapsed; promise still incomplete");
                return;
            }
        }
        // Blob first: if the removal fails the live slot stays, so the
        // promise is never left with neither a live object nor a blob.
        if let Err(e) = self.blobs.remove(id) {
            warn!(promise_id = %id, error = %e, "failed to remove expired promise blob");
            return;
        }
        self.live.remove(&id);
        debug!(promise_id = %id, "promise expired");
    }

    /// Subscribe the persist-and-demote handler.
    ///
    /// The handler may run on any completing thread. It takes no store or
    /// promise locks of its own beyond the live map shard, so it is safe to
    /// invoke from inside promise completion.
    fn attach_completion_handler(self: &Arc<Self>, promise: &Arc<Promise>) {
        let store = Arc::downgrade(self);
        promise.subscribe(Box::new(move |completed| {
            if let Some(store) = store.upgrade() {
                store.persist_and_demote(completed);
            }
        }));
    }

    fn persist_and_demote(&self, promise: &Arc<Promise>) {
        let id = promise.id();
        let Some(outcome) = promise.outcome() else {
            return;
        };

        let value = match encode_outcome(&outcome) {
            Ok(value) => value,
            Err(SluiceError::OversizePromise { len, max }) => {
                debug!(
                    promise_id = %id,
                    len,
                    max,
                    "payload exceeds persistence cap; keeping promise memory-resident"
                );
                return;
            }
            Err(e) => {
                warn!(promise_id = %id, error = %e, "failed to encode promise blob");
                return;
            }
        };

        match self.blobs.put(id, &value) {
            Ok(()) => {
                self.live.insert(id, LiveRef::Weak(Arc::downgrade(promise)));
                debug!(promise_id = %id, len = value.len(), "promise persisted and demoted");
            }
            Err(e) => {
                // Non-fatal: the strong reference stays, the promise lives
                // in memory only.
                warn!(promise_id = %id, error = %e, "blob write failed; keeping promise memory-resident");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MAX_BLOB_LEN;
    use crate::promise::SchemaCode;
    use crate::storage::MemoryBlobStore;

    fn store() -> (Arc<PromiseStore>, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let schemas = Arc::new(SchemaRegistry::new());
        schemas.register(SchemaCode(1), "test-payload");
        (
            PromiseStore::new(1, blobs.clone(), schemas),
            blobs,
        )
    }

    fn payload(bytes: Vec<u8>) -> PromisePayload {
        PromisePayload::new(SchemaCode(1), bytes)
    }

    #[test]
    fn create_mints_distinct_ordered_ids() {
        let (store, _) = store();
        let a = store.create(None, None);
        let b = store.create(None, None);
        assert!(a.id() < b.id());
        assert_eq!(a.id().service_id, 1);
    }

    #[test]
    fn incomplete_promises_are_strongly_retained() {
        let (store, blobs) = store();
        let id = {
            let p = store.create(None, None);
            p.id()
        };
        // The caller dropped its Arc, but the store keeps incomplete
        // promises alive.
        assert!(store.get_by_id(id).is_some());
        assert!(blobs.is_empty());
        assert_eq!(store.stats().strong, 1);
    }

    #[test]
    fn completion_persists_and_demotes() {
        let (store, blobs) = store();
        let p = store.create(None, None);
        let id = p.id();

        assert!(p.try_complete(PromiseOutcome::Completed(payload(vec![7u8; 1024]))));
        assert_eq!(blobs.len(), 1);
        assert_eq!(store.stats().weak_live, 1);

        // While the caller still holds the Arc, lookups share it.
        let again = store.get_by_id(id).unwrap();
        assert!(Arc::ptr_eq(&p, &again));
    }

    #[test]
    fn rehydration_returns_identical_payload_bytes() {
        let (store, _) = store();
        let body: Vec<u8> = (0..1024u32).map(|i| (i * 31 % 256) as u8).collect();
        let id = {
            let p = store.create(None, None);
            p.try_complete(PromiseOutcome::Completed(payload(body.clone())));
            p.id()
        };
        // Every strong reference is gone; the weak slot is dead.

        let rebuilt = store.get_by_id(id).expect("rehydrated from blob store");
        assert!(rebuilt.is_complete());
        assert_eq!(
            rebuilt.outcome().unwrap().payload().unwrap().body.as_ref(),
            body.as_slice()
        );
    }

    #[test]
    fn oversize_completion_stays_memory_resident() {
        let (store, blobs) = store();
        let p = store.create(None, None);
        let id = p.id();

        p.try_complete(PromiseOutcome::Completed(payload(vec![0u8; MAX_BLOB_LEN])));
        assert!(blobs.is_empty());
        assert_eq!(store.stats().strong, 1);

        // Still reachable: complete promises are never left with neither a
        // live object nor a blob.
        drop(p);
        assert!(store.get_by_id(id).is_some());
    }

    #[test]
    fn create_with_outcome_persists_immediately() {
        let (store, blobs) = store();
        let p = store.create(
            None,
            Some(PromiseOutcome::Completed(payload(b"prefilled".to_vec()))),
        );
        assert!(p.is_complete());
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn sweep_prunes_dead_weak_slots() {
        let (store, _) = store();
        for _ in 0..8 {
            let p = store.create(None, None);
            p.try_complete(PromiseOutcome::Completed(payload(vec![1, 2, 3])));
        }
        assert_eq!(store.stats().weak_dead, 8);

        // Drive enough operations to cross the sweep interval.
        for _ in 0..2 * SWEEP_INTERVAL {
            let _ = store.get_by_id(PromiseId::new(99, 99));
        }
        assert_eq!(store.stats().weak_dead, 0);
    }

    #[test]
    fn unknown_id_is_a_miss() {
        let (store, _) = store();
        assert!(store.get_by_id(PromiseId::new(5, 5)).is_none());
    }

    #[test]
    fn expired_promise_is_forgotten() {
        let (store, blobs) = store();
        let p = store.create(None, None);
        let id = p.id();
        p.try_complete(PromiseOutcome::Completed(payload(vec![1, 2, 3])));
        assert_eq!(blobs.len(), 1);

        store.schedule_promise_expiry(&p, Duration::ZERO);
        drop(p);
        // The next store operation drains due retention deadlines.
        let _ = store.get_by_id(PromiseId::new(99, 99));

        assert!(blobs.is_empty());
        assert!(store.get_by_id(id).is_none());
    }

    #[test]
    fn expiry_before_the_deadline_changes_nothing() {
        let (store, blobs) = store();
        let p = store.create(None, None);
        p.try_complete(PromiseOutcome::Completed(payload(vec![7; 16])));

        store.schedule_promise_expiry(&p, Duration::from_secs(3600));
        let _ = store.get_by_id(PromiseId::new(99, 99));

        assert_eq!(blobs.len(), 1);
        assert!(store.get_by_id(p.id()).is_some());
    }

    #[test]
    fn expiry_lapses_while_the_promise_is_incomplete() {
        let (store, _) = store();
        let p = store.create(None, None);

        store.schedule_promise_expiry(&p, Duration::ZERO);
        let _ = store.get_by_id(PromiseId::new(99, 99));

        // Still strongly retained and reachable.
        assert!(store.get_by_id(p.id()).is_some());
        assert_eq!(store.stats().strong, 1);
    }
}
