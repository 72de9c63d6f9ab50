//! Scheduling flows: the weighted-fair queue primitive the whole scheduler
//! is composed from.
//!
//! A *flow* is anything that can hand out scheduled items. Leaves are client
//! job queues; a [`SchedulingGroup`] multiplexes child flows with
//! deficit-weighted round robin and can itself be a child of another group,
//! which is how the priority → owner → named-queue hierarchy is built.
//!
//! # Activation events
//!
//! A child tells its group that it flipped between idle and non-empty by
//! sending an [`ActivationEvent`]. Events are emitted *outside* the
//! emitter's lock, so they can arrive out of order; each carries a
//! per-child monotone counter and the group discards anything that is not
//! strictly newer than what it has already applied. Alongside the event
//! stream, every enqueue sends an unconditional wake poke up the parent
//! chain — pokes carry no state, so reordering them is harmless, and they
//! are what gets the root dispatcher out of its idle await.
//!
//! # Fairness
//!
//! Within one flow: FIFO. Across siblings: deficit round robin. Each active
//! child accrues `weight` units of deficit when it reaches the head of the
//! rotation and pays the charge of every item it releases; it keeps the
//! head slot until its deficit is spent. Ties are broken by rotation
//! position, so ordering across siblings is weight-fair but not strictly
//! deterministic.
//!
//! # Locking
//!
//! Every flow releases its own lock before calling into any other flow or
//! emitting events. The group's dequeue picks a candidate under its lock,
//! releases, pulls from the child, then re-locks to settle the deficit.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::Notify;

use crate::macro_job::MacroJobMessage;
use crate::manager::JobMessage;

/// Default weight assigned to children of a scheduling group.
pub const DEFAULT_WEIGHT: u32 = 10;

/// Charge attributed to an item whose work carries no estimate of its own.
pub const DEFAULT_CHARGE: i64 = 10;

// =============================================================================
// Items
// =============================================================================

/// One entry in a scheduling flow.
pub enum ScheduledItem {
    /// An individually launchable micro-job.
    Job(JobMessage),
    /// A macro-job participant that expands into micro-jobs at dequeue time.
    Macro(Arc<MacroJobMessage>),
}

impl ScheduledItem {
    /// Charge units this item costs its flow when dequeued.
    pub fn charge(&self) -> i64 {
        match self {
            ScheduledItem::Job(message) => message.work.initial_charge,
            ScheduledItem::Macro(_) => DEFAULT_CHARGE,
        }
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// Read-only view of a scheduling account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub queued: u64,
    pub served: u64,
    pub charged: i64,
}

#[derive(Default)]
struct AccountInner {
    queued: AtomicU64,
    served: AtomicU64,
    charged: AtomicI64,
}

/// Per-queue accumulator of served work, used by the weighted-fair policy
/// and exposed as an observable.
///
/// The charge is time-weighted: items are charged an estimate when they are
/// released from the queue, and the dispatcher posts the difference against
/// measured execution afterwards.
#[derive(Clone, Default)]
pub struct SchedulingAccount(Arc<AccountInner>);

impl SchedulingAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_queued(&self) {
        self.0.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_served(&self) {
        self.0.served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_charge(&self, delta: i64) {
        self.0.charged.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            queued: self.0.queued.load(Ordering::Relaxed),
            served: self.0.served.load(Ordering::Relaxed),
            charged: self.0.charged.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SchedulingAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("SchedulingAccount")
            .field("queued", &snapshot.queued)
            .field("served", &snapshot.served)
            .field("charged", &snapshot.charged)
            .finish()
    }
}

// =============================================================================
// Events
// =============================================================================

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a flow within the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId(u64);

impl FlowId {
    pub(crate) fn next() -> Self {
        Self(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// A child flipped between idle and non-empty.
///
/// `counter` is monotone per child; receivers discard anything not strictly
/// newer than the last applied value.
#[derive(Clone, Copy, Debug)]
pub struct ActivationEvent {
    pub child: FlowId,
    pub counter: u64,
    pub activated: bool,
}

/// Where a flow delivers its activation events and wake pokes.
#[derive(Clone)]
pub struct ActivationSink {
    events: Arc<dyn Fn(ActivationEvent) + Send + Sync>,
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl ActivationSink {
    pub fn new(
        events: impl Fn(ActivationEvent) + Send + Sync + 'static,
        wake: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            events: Arc::new(events),
            wake: Arc::new(wake),
        }
    }

    pub fn send(&self, event: ActivationEvent) {
        (self.events)(event);
    }

    pub fn wake(&self) {
        (self.wake)();
    }
}

// =============================================================================
// Flow Trait
// =============================================================================

/// The single interface leaves and groups share.
pub trait SchedulingFlow: Send + Sync {
    fn flow_id(&self) -> FlowId;

    /// Release the next item, if any. Implementations must not hold their
    /// own lock while calling into another flow.
    fn try_take(&self) -> Option<ScheduledItem>;

    /// Whether the flow currently has nothing to release.
    fn is_idle(&self) -> bool;

    /// Wire the flow to its enclosing group. Called once, at admit time.
    fn bind_parent(&self, sink: ActivationSink);
}

// =============================================================================
// Groups
// =============================================================================

struct ChildEntry {
    flow: Arc<dyn SchedulingFlow>,
    weight: u32,
    deficit: i64,
    active: bool,
    last_counter: u64,
}

struct GroupState {
    children: HashMap<FlowId, ChildEntry>,
    /// Round-robin ring of active children.
    rotation: VecDeque<FlowId>,
    active: bool,
    counter: u64,
}

/// Multiplexes child flows with deficit-weighted round robin.
pub struct SchedulingGroup {
    id: FlowId,
    state: Mutex<GroupState>,
    ready: Notify,
    parent: Mutex<Option<ActivationSink>>,
    listener: Mutex<Option<ActivationSink>>,
}

impl SchedulingGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: FlowId::next(),
            state: Mutex::new(GroupState {
                children: HashMap::new(),
                rotation: VecDeque::new(),
                active: false,
                counter: 0,
            }),
            ready: Notify::new(),
            parent: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    /// Observer hook for keyed collections: receives every accepted child
    /// event, after the group has applied it.
    pub fn set_listener(&self, sink: ActivationSink) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Admit a child with the given weight. The child is wired back to this
    /// group and starts out idle.
    pub fn admit(self: &Arc<Self>, child: Arc<dyn SchedulingFlow>, weight: u32) {
        debug_assert!(weight > 0, "scheduling weights must be positive");
        let id = child.flow_id();
        {
            let mut state = self.lock();
            state.children.insert(
                id,
                ChildEntry {
                    flow: child.clone(),
                    weight: weight.max(1),
                    deficit: 0,
                    active: false,
                    last_counter: 0,
                },
            );
        }
        child.bind_parent(self.child_sink());
    }

    /// Detach a child, returning it. Pending events from the child are
    /// ignored from here on.
    pub fn remove_child(&self, id: FlowId) -> Option<Arc<dyn SchedulingFlow>> {
        let (removed, flip_event) = {
            let mut state = self.lock();
            let removed = state.children.remove(&id)?;
            state.rotation.retain(|child| *child != id);
            (Some(removed.flow), self.settle_activity(&mut state))
        };
        self.forward_flip(flip_event);
        removed
    }

    /// Adjust a child's weight. Returns `false` for unknown children or a
    /// zero weight.
    pub fn set_weight(&self, id: FlowId, weight: u32) -> bool {
        if weight == 0 {
            return false;
        }
        let mut state = self.lock();
        match state.children.get_mut(&id) {
            Some(entry) => {
                entry.weight = weight;
                true
            }
            None => false,
        }
    }

    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Wait until an item can be released, then release it.
    ///
    /// The waiter is registered before the non-blocking attempt so a wake
    /// between the attempt and the await is never lost.
    pub async fn take(self: &Arc<Self>) -> ScheduledItem {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = SchedulingFlow::try_take(self.as_ref()) {
                return item;
            }
            notified.await;
        }
    }

    fn child_sink(self: &Arc<Self>) -> ActivationSink {
        let for_events: Weak<SchedulingGroup> = Arc::downgrade(self);
        let for_wakes: Weak<SchedulingGroup> = Arc::downgrade(self);
        ActivationSink::new(
            move |event| {
                if let Some(group) = for_events.upgrade() {
                    group.on_child_activation(event);
                }
            },
            move || {
                if let Some(group) = for_wakes.upgrade() {
                    group.wake_up();
                }
            },
        )
    }

    /// Unconditional wake: notify the local waiter and poke upward. Pokes
    /// carry no state, so spurious or reordered delivery is harmless.
    fn wake_up(&self) {
        self.ready.notify_waiters();
        let parent = self.parent.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(parent) = parent {
            parent.wake();
        }
    }

    fn on_child_activation(&self, event: ActivationEvent) {
        let flip_event = {
            let mut state = self.lock();
            let Some(entry) = state.children.get_mut(&event.child) else {
                // Child already removed (or never admitted); stale event.
                return;
            };
            if event.counter <= entry.last_counter {
                // Out-of-order delivery: a newer event has been applied.
                return;
            }
            entry.last_counter = event.counter;
            if entry.active == event.activated {
                return;
            }
            entry.active = event.activated;
            if event.activated {
                entry.deficit = 0;
                state.rotation.push_back(event.child);
            } else {
                state.rotation.retain(|child| *child != event.child);
            }
            self.settle_activity(&mut state)
        };

        if event.activated {
            self.ready.notify_waiters();
        }
        self.forward_flip(flip_event);

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener.send(event);
        }
    }

    /// Recompute the group's own activity; returns the event to forward when
    /// it flipped. Must be called with the state lock held.
    fn settle_activity(&self, state: &mut GroupState) -> Option<ActivationEvent> {
        let now_active = !state.rotation.is_empty();
        if now_active == state.active {
            return None;
        }
        state.active = now_active;
        state.counter += 1;
        Some(ActivationEvent {
            child: self.id,
            counter: state.counter,
            activated: now_active,
        })
    }

    fn forward_flip(&self, event: Option<ActivationEvent>) {
        let Some(event) = event else { return };
        let parent = self.parent.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(parent) = parent {
            parent.send(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SchedulingFlow for SchedulingGroup {
    fn flow_id(&self) -> FlowId {
        self.id
    }

    fn try_take(&self) -> Option<ScheduledItem> {
        // Bounded by the number of active children: each pass either
        // returns an item or rotates a child out of the head slot.
        let mut attempts = self.lock().rotation.len() + 1;

        while attempts > 0 {
            attempts -= 1;

            let candidate = {
                let mut state = self.lock();
                loop {
                    let Some(&head) = state.rotation.front() else {
                        break None;
                    };
                    let Some(entry) = state.children.get_mut(&head) else {
                        state.rotation.pop_front();
                        continue;
                    };
                    if !entry.active {
                        state.rotation.pop_front();
                        continue;
                    }
                    if entry.deficit <= 0 {
                        entry.deficit += entry.weight as i64;
                    }
                    if entry.deficit > 0 {
                        break Some((head, entry.flow.clone()));
                    }
                    state.rotation.rotate_left(1);
                }
            };

            let (head, flow) = candidate?;
            match flow.try_take() {
                Some(item) => {
                    let charge = item.charge();
                    let mut state = self.lock();
                    if let Some(entry) = state.children.get_mut(&head) {
                        entry.deficit -= charge;
                        if entry.deficit <= 0 && state.rotation.front() == Some(&head) {
                            state.rotation.rotate_left(1);
                        }
                    }
                    return Some(item);
                }
                None => {
                    // Marked active but empty: its deactivation event is in
                    // flight. Step past it and let the event catch up.
                    let mut state = self.lock();
                    if state.rotation.front() == Some(&head) {
                        state.rotation.rotate_left(1);
                    }
                }
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        !self.lock().active
    }

    fn bind_parent(&self, sink: ActivationSink) {
        // Replay current activity so a group admitted while already holding
        // work is visible to the new parent.
        let replay = {
            let state = self.lock();
            state.active.then_some(ActivationEvent {
                child: self.id,
                counter: state.counter,
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

impl fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SchedulingGroup")
            .field("id", &self.id)
            .field("children", &state.children.len())
            .field("active", &state.rotation.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_queues::{ClientJobQueue, JobQueueKey};
    use crate::manager::WorkDescriptor;
    use crate::promise::{Promise, PromiseId};
    use tokio_util::sync::CancellationToken;

    fn test_queue(name: &str) -> Arc<ClientJobQueue> {
        ClientJobQueue::new(JobQueueKey {
            owner: uuid::Uuid::new_v4(),
            priority: 0,
            name: name.to_string(),
        })
    }

    fn test_item(sequence: u64, charge: i64) -> ScheduledItem {
        let mut work = WorkDescriptor::new("test");
        work.initial_charge = charge;
        ScheduledItem::Job(JobMessage {
            promise: Promise::new(PromiseId::new(1, sequence), None),
            work,
            account: SchedulingAccount::new(),
            cancel: CancellationToken::new(),
        })
    }

    fn drain(group: &Arc<SchedulingGroup>) -> Vec<PromiseId> {
        let mut taken = Vec::new();
        while let Some(item) = SchedulingFlow::try_take(group.as_ref()) {
            match item {
                ScheduledItem::Job(message) => taken.push(message.promise.id()),
                ScheduledItem::Macro(_) => unreachable!("test only queues jobs"),
            }
        }
        taken
    }

    #[test]
    fn single_child_is_fifo() {
        let group = SchedulingGroup::new();
        let queue = test_queue("only");
        group.admit(queue.clone(), DEFAULT_WEIGHT);

        for sequence in 1..=4 {
            queue.enqueue(test_item(sequence, DEFAULT_CHARGE));
        }
        let order: Vec<u64> = drain(&group).into_iter().map(|id| id.sequence).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(group.is_idle());
    }

    #[test]
    fn service_is_proportional_to_weight() {
        let group = SchedulingGroup::new();
        let light = test_queue("light");
        let heavy = test_queue("heavy");
        group.admit(light.clone(), 10);
        group.admit(heavy.clone(), 20);

        for sequence in 0..300 {
            light.enqueue(test_item(1_000 + sequence, DEFAULT_CHARGE));
            heavy.enqueue(test_item(2_000 + sequence, DEFAULT_CHARGE));
        }

        // Release 150 items and count per-queue service.
        let mut light_served = 0usize;
        let mut heavy_served = 0usize;
        for _ in 0..150 {
            match SchedulingFlow::try_take(group.as_ref()).expect("items remain") {
                ScheduledItem::Job(message) => {
                    if message.promise.id().sequence < 2_000 {
                        light_served += 1;
                    } else {
                        heavy_served += 1;
                    }
                }
                ScheduledItem::Macro(_) => unreachable!(),
            }
        }
        assert_eq!(light_served + heavy_served, 150);
        assert_eq!(light_served, 50);
        assert_eq!(heavy_served, 100);
    }

    #[test]
    fn stale_activation_events_are_discarded() {
        let group = SchedulingGroup::new();
        let queue = test_queue("raced");
        group.admit(queue.clone(), DEFAULT_WEIGHT);

        queue.enqueue(test_item(1, DEFAULT_CHARGE));
        assert!(!group.is_idle());

        // An old deactivation delivered late must not mark the child idle.
        group.on_child_activation(ActivationEvent {
            child: queue.flow_id(),
            counter: 0,
            activated: false,
        });
        assert!(!group.is_idle());
        assert_eq!(drain(&group).len(), 1);
    }

    #[test]
    fn removed_children_are_skipped() {
        let group = SchedulingGroup::new();
        let stays = test_queue("stays");
        let leaves = test_queue("leaves");
        group.admit(stays.clone(), DEFAULT_WEIGHT);
        group.admit(leaves.clone(), DEFAULT_WEIGHT);

        stays.enqueue(test_item(1, DEFAULT_CHARGE));
        leaves.enqueue(test_item(2, DEFAULT_CHARGE));

        assert!(group.remove_child(leaves.flow_id()).is_some());
        let order: Vec<u64> = drain(&group).into_iter().map(|id| id.sequence).collect();
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn weight_updates_apply_at_runtime() {
        let group = SchedulingGroup::new();
        let queue = test_queue("tuned");
        group.admit(queue.clone(), DEFAULT_WEIGHT);

        assert!(group.set_weight(queue.flow_id(), 30));
        assert!(!group.set_weight(queue.flow_id(), 0));
        assert!(!group.set_weight(FlowId::next(), 10));
    }

    #[tokio::test]
    async fn take_wakes_on_enqueue() {
        let group = SchedulingGroup::new();
        let queue = test_queue("async");
        group.admit(queue.clone(), DEFAULT_WEIGHT);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.take().await })
        };
        // Give the waiter a chance to park before the enqueue.
        tokio::task::yield_now().await;
        queue.enqueue(test_item(9, DEFAULT_CHARGE));

        let item = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("take must wake")
            .unwrap();
        match item {
            ScheduledItem::Job(message) => assert_eq!(message.promise.id().sequence, 9),
            ScheduledItem::Macro(_) => unreachable!(),
        }
    }
}
