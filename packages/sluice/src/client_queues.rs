//! Client job queues and keyed flow collections with idle expiry.
//!
//! A [`ClientJobQueue`] is the leaf of the scheduling hierarchy: the FIFO of
//! scheduled work belonging to one `(owner, priority, name)` tuple, carrying
//! its scheduling account and a cancellation token for group termination.
//!
//! [`KeyedFlows`] is the keyed collection used twice in the hierarchy —
//! owner → owner-queues and name → client queue. Every member carries equal
//! scheduling weight. Members that sit idle are removed by a single shared
//! [`ExpiryQueue`]:
//!
//! - a member that goes idle records its deactivation instant and enters the
//!   expiry queue (at most one pending probe per member),
//! - a member that reactivates clears the instant, which the next probe
//!   recognizes as "not expirable",
//! - a newly added member counts as deactivated-now, so it expires even if
//!   it is never used.
//!
//! Activation and deactivation events arrive concurrently and possibly out
//! of order; each member keeps an epoch and accepts only strictly newer
//! events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::flow::{
    AccountSnapshot, ActivationEvent, ActivationSink, FlowId, ScheduledItem, SchedulingAccount,
    SchedulingFlow, SchedulingGroup, DEFAULT_WEIGHT,
};

/// Opaque identity of the client (or tenant) that owns a queue.
pub type OwnerId = Uuid;

/// Addresses one client job queue in the hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobQueueKey {
    pub owner: OwnerId,
    pub priority: u32,
    pub name: String,
}

// =============================================================================
// Client Job Queue
// =============================================================================

struct QueueInner {
    items: VecDeque<ScheduledItem>,
    active: bool,
    counter: u64,
}

/// Ordered queue of scheduled work for one `(owner, priority, name)` tuple.
pub struct ClientJobQueue {
    id: FlowId,
    key: JobQueueKey,
    account: SchedulingAccount,
    cancel: CancellationToken,
    inner: Mutex<QueueInner>,
    parent: Mutex<Option<ActivationSink>>,
}

impl ClientJobQueue {
    pub fn new(key: JobQueueKey) -> Arc<Self> {
        Arc::new(Self {
            id: FlowId::next(),
            key,
            account: SchedulingAccount::new(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                active: false,
                counter: 0,
            }),
            parent: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &JobQueueKey {
        &self.key
    }

    pub fn account(&self) -> &SchedulingAccount {
        &self.account
    }

    /// Token used for group termination of everything queued here.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fire the group-termination token. Items already queued are dropped
    /// at dispatch time.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn stats(&self) -> AccountSnapshot {
        self.account.snapshot()
    }

    /// Append an item, emitting the idle→non-empty flip to the enclosing
    /// group when this was the first item.
    pub fn enqueue(&self, item: ScheduledItem) {
        let flip = {
            let mut inner = self.lock();
            inner.items.push_back(item);
            self.account.note_queued();
            if inner.active {
                None
            } else {
                inner.active = true;
                inner.counter += 1;
                Some(ActivationEvent {
                    child: self.id,
                    counter: inner.counter,
                    activated: true,
                })
            }
        };

        let parent = self.parent.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(parent) = parent {
            if let Some(event) = flip {
                parent.send(event);
            }
            // Every enqueue pokes upward so a dispatcher parked between an
            // event pair and its reordering never sleeps through new work.
            parent.wake();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SchedulingFlow for ClientJobQueue {
    fn flow_id(&self) -> FlowId {
        self.id
    }

    fn try_take(&self) -> Option<ScheduledItem> {
        let (item, flip) = {
            let mut inner = self.lock();
            let item = inner.items.pop_front()?;
            self.account.note_served();
            self.account.add_charge(item.charge());
            let flip = if inner.items.is_empty() {
                inner.active = false;
                inner.counter += 1;
                Some(ActivationEvent {
                    child: self.id,
                    counter: inner.counter,
                    activated: false,
                })
            } else {
                None
            };
            (item, flip)
        };

        if let Some(event) = flip {
            let parent = self.parent.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(parent) = parent {
                parent.send(event);
            }
        }
        Some(item)
    }

    fn is_idle(&self) -> bool {
        !self.lock().active
    }

    fn bind_parent(&self, sink: ActivationSink) {
        // Replay the current activation state through the new sink: items
        // enqueued before the queue was admitted emitted their flip into
        // the void, and the group must still learn about them.
        let replay = {
            let inner = self.lock();
            inner.active.then_some(ActivationEvent {
                child: self.id,
                counter: inner.counter,
                activated: true,
            })
        };
        *self.parent.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink.clone());
        if let Some(event) = replay {
            sink.send(event);
            sink.wake();
        }
    }
}

// =============================================================================
// Expiry Queue
// =============================================================================

/// What an expiry probe decided when it fired.
pub enum ExpiryDisposition {
    /// The member was removed, reactivated, or is gone; drop the probe.
    Done,
    /// The member is idle but not old enough yet; probe again later.
    Requeue,
}

/// A scheduled expiry check. Re-checks the member's state when it fires.
pub type ExpiryProbe = Box<dyn FnMut() -> ExpiryDisposition + Send>;

struct ExpiryBuckets {
    buckets: Vec<Vec<ExpiryProbe>>,
    cursor: usize,
}

/// Single shared timer wheel driving idle-queue expiry.
///
/// Probes are coarsely placed into the bucket furthest from the cursor and
/// re-check the actual deactivation instant when they fire, so bucket
/// granularity affects timeliness, never correctness.
pub struct ExpiryQueue {
    expiry: Duration,
    tick: Duration,
    state: Mutex<ExpiryBuckets>,
}

impl ExpiryQueue {
    pub fn new(expiry: Duration, bucket_count: u32) -> Arc<Self> {
        let bucket_count = bucket_count.max(1) as usize;
        let tick = expiry / bucket_count as u32;
        Arc::new(Self {
            expiry,
            tick: tick.max(Duration::from_millis(1)),
            state: Mutex::new(ExpiryBuckets {
                buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
                cursor: 0,
            }),
        })
    }

    pub fn expiry_ticks(&self) -> Duration {
        self.expiry
    }

    pub fn push(&self, probe: ExpiryProbe) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let len = state.buckets.len();
        let slot = (state.cursor + len - 1) % len;
        state.buckets[slot].push(probe);
    }

    /// Fire the bucket under the cursor and advance it.
    pub fn run_pending(&self) {
        let mut due = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let cursor = state.cursor;
            state.cursor = (cursor + 1) % state.buckets.len();
            std::mem::take(&mut state.buckets[cursor])
        };

        let mut retained = Vec::new();
        for mut probe in due.drain(..) {
            match probe() {
                ExpiryDisposition::Done => {}
                ExpiryDisposition::Requeue => retained.push(probe),
            }
        }
        for probe in retained {
            self.push(probe);
        }
    }

    /// Spawn the periodic pump. Runs until the shutdown token fires.
    pub fn spawn_pump(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let wheel = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(wheel.tick);
            interval.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => wheel.run_pending(),
                }
            }
            trace!("expiry pump stopped");
        })
    }
}

// =============================================================================
// Keyed Flows
// =============================================================================

struct FlowEntry<V> {
    value: Arc<V>,
    epoch: AtomicU64,
    /// `None` means active (not expirable); `Some` is the deactivation
    /// instant used by expiry probes.
    deactivated_at: Mutex<Option<Instant>>,
    in_expiry_queue: AtomicBool,
}

struct KeyedInner<K, V> {
    group: Arc<SchedulingGroup>,
    entries: DashMap<K, Arc<FlowEntry<V>>>,
    by_flow: DashMap<FlowId, K>,
    expiry: Arc<ExpiryQueue>,
    factory: Box<dyn Fn(&K) -> Arc<V> + Send + Sync>,
    child_weight: u32,
}

/// Keyed collection of equally-weighted flows with idle expiry.
pub struct KeyedFlows<K, V> {
    inner: Arc<KeyedInner<K, V>>,
}

impl<K, V> Clone for KeyedFlows<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> KeyedFlows<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: SchedulingFlow + Send + Sync + 'static,
{
    pub fn new(
        expiry: Arc<ExpiryQueue>,
        factory: impl Fn(&K) -> Arc<V> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(KeyedInner {
            group: SchedulingGroup::new(),
            entries: DashMap::new(),
            by_flow: DashMap::new(),
            expiry,
            factory: Box::new(factory),
            child_weight: DEFAULT_WEIGHT,
        });

        let listener: Weak<KeyedInner<K, V>> = Arc::downgrade(&inner);
        inner.group.set_listener(ActivationSink::new(
            move |event| {
                if let Some(inner) = listener.upgrade() {
                    Self::on_member_event(&inner, event);
                }
            },
            || {},
        ));
        Self { inner }
    }

    /// The group multiplexing this collection's members; admit it into the
    /// enclosing tier to wire the hierarchy.
    pub fn group(&self) -> &Arc<SchedulingGroup> {
        &self.inner.group
    }

    /// Return the member for `key`, creating, admitting, and arming it for
    /// expiry when absent.
    pub fn get_or_add(&self, key: &K) -> Arc<V> {
        if let Some(found) = self.try_get(key) {
            return found;
        }

        let mut created: Option<Arc<FlowEntry<V>>> = None;
        let entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                let value = (self.inner.factory)(key);
                let entry = Arc::new(FlowEntry {
                    value,
                    epoch: AtomicU64::new(0),
                    // Newly added members count as deactivated-now so an
                    // entry that is never used still expires.
                    deactivated_at: Mutex::new(Some(Instant::now())),
                    in_expiry_queue: AtomicBool::new(true),
                });
                created = Some(entry.clone());
                entry
            })
            .value()
            .clone();

        if let Some(new_entry) = created {
            let flow_id = new_entry.value.flow_id();
            self.inner.by_flow.insert(flow_id, key.clone());
            self.inner
                .group
                .admit(new_entry.value.clone(), self.inner.child_weight);
            self.arm_expiry(key.clone(), &new_entry);
            debug!(flow = %flow_id, "admitted new member");
        }
        entry.value.clone()
    }

    /// Read-only lookup; the result may be stale by the time the caller
    /// inspects it.
    pub fn try_get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Snapshot of the current membership.
    pub fn list_members(&self) -> Vec<(K, Arc<V>)> {
        self.inner
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn on_member_event(inner: &Arc<KeyedInner<K, V>>, event: ActivationEvent) {
        let Some(key) = inner.by_flow.get(&event.child).map(|k| k.clone()) else {
            return;
        };
        let Some(entry) = inner.entries.get(&key).map(|e| e.clone()) else {
            return;
        };

        // Accept only strictly newer events; listener invocations can be
        // reordered between the group unlock and this point.
        loop {
            let seen = entry.epoch.load(Ordering::Acquire);
            if event.counter <= seen {
                return;
            }
            if entry
                .epoch
                .compare_exchange(seen, event.counter, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        if event.activated {
            *entry
                .deactivated_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = None;
        } else {
            *entry
                .deactivated_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            if !entry.in_expiry_queue.swap(true, Ordering::AcqRel) {
                Self::arm_expiry_static(inner, key, &entry);
            }
        }
    }

    fn arm_expiry(&self, key: K, entry: &Arc<FlowEntry<V>>) {
        Self::arm_expiry_static(&self.inner, key, entry);
    }

    fn arm_expiry_static(inner: &Arc<KeyedInner<K, V>>, key: K, entry: &Arc<FlowEntry<V>>) {
        let weak: Weak<KeyedInner<K, V>> = Arc::downgrade(inner);
        let entry = entry.clone();
        inner.expiry.push(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return ExpiryDisposition::Done;
            };
            let expiry = inner.expiry.expiry_ticks();

            let deactivated_at = *entry
                .deactivated_at
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match deactivated_at {
                None => {
                    // Reactivated since: leave the expiry queue.
                    entry.in_expiry_queue.store(false, Ordering::Release);
                    ExpiryDisposition::Done
                }
                Some(instant) if instant.elapsed() >= expiry => {
                    let flow_id = entry.value.flow_id();
                    inner.group.remove_child(flow_id);
                    inner.by_flow.remove(&flow_id);
                    inner
                        .entries
                        .remove_if(&key, |_, existing| Arc::ptr_eq(existing, &entry));
                    debug!(flow = %flow_id, "expired idle member");
                    ExpiryDisposition::Done
                }
                Some(_) => ExpiryDisposition::Requeue,
            }
        }));
    }
}
