//! The prioritized queue system: a fixed array of weighted priority tiers
//! composed over keyed owner collections.
//!
//! Hierarchy, root downwards:
//!
//! ```text
//! root group ──► priority p (weight (p+1)·10, adjustable)
//!                  └─► owner group (equal weights)
//!                        └─► named client job queue (equal weights)
//! ```
//!
//! Higher indices receive more service by default, but weights are
//! reconfigurable at runtime.

use std::sync::Arc;

use serde::Serialize;

use crate::client_queues::{
    ClientJobQueue, ExpiryQueue, JobQueueKey, KeyedFlows, OwnerId,
};
use crate::error::SluiceError;
use crate::flow::{
    AccountSnapshot, ActivationSink, FlowId, ScheduledItem, SchedulingFlow, SchedulingGroup,
};

/// Default weight of priority class `p`.
pub fn default_priority_weight(priority: u32) -> u32 {
    (priority + 1) * 10
}

/// The per-owner tier inside one priority class: a keyed collection of
/// named client job queues.
pub struct OwnerQueues {
    owner: OwnerId,
    priority: u32,
    queues: KeyedFlows<String, ClientJobQueue>,
}

impl OwnerQueues {
    fn new(owner: OwnerId, priority: u32, expiry: Arc<ExpiryQueue>) -> Arc<Self> {
        let queues = KeyedFlows::new(expiry, move |name: &String| {
            ClientJobQueue::new(JobQueueKey {
                owner,
                priority,
                name: name.clone(),
            })
        });
        Arc::new(Self {
            owner,
            priority,
            queues,
        })
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn get_or_add(&self, name: &str) -> Arc<ClientJobQueue> {
        self.queues.get_or_add(&name.to_string())
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<ClientJobQueue>> {
        self.queues.try_get(&name.to_string())
    }

    pub fn list_queues(&self) -> Vec<(String, Arc<ClientJobQueue>)> {
        self.queues.list_members()
    }
}

impl SchedulingFlow for OwnerQueues {
    fn flow_id(&self) -> FlowId {
        self.queues.group().flow_id()
    }

    fn try_take(&self) -> Option<ScheduledItem> {
        SchedulingFlow::try_take(self.queues.group().as_ref())
    }

    fn is_idle(&self) -> bool {
        SchedulingFlow::is_idle(self.queues.group().as_ref())
    }

    fn bind_parent(&self, sink: ActivationSink) {
        self.queues.group().bind_parent(sink);
    }
}

struct PriorityLevel {
    owners: KeyedFlows<OwnerId, OwnerQueues>,
    flow_id: FlowId,
}

/// Per-queue observable exposed through [`PriorityScheduler::queue_snapshots`].
#[derive(Clone, Debug, Serialize)]
pub struct QueueSnapshot {
    pub owner: OwnerId,
    pub priority: u32,
    pub name: String,
    pub depth: usize,
    pub account: AccountSnapshot,
}

/// Fixed array of weighted priority classes with a root channel for the
/// dispatcher.
pub struct PriorityScheduler {
    root: Arc<SchedulingGroup>,
    levels: Vec<PriorityLevel>,
}

impl PriorityScheduler {
    pub fn new(count_priorities: u32, expiry: Arc<ExpiryQueue>) -> Result<Arc<Self>, SluiceError> {
        if count_priorities == 0 {
            return Err(SluiceError::user_input(
                "count_priorities must be at least 1",
            ));
        }

        let root = SchedulingGroup::new();
        let mut levels = Vec::with_capacity(count_priorities as usize);
        for priority in 0..count_priorities {
            let expiry_for_names = expiry.clone();
            let owners = KeyedFlows::new(expiry.clone(), move |owner: &OwnerId| {
                OwnerQueues::new(*owner, priority, expiry_for_names.clone())
            });
            let flow: Arc<SchedulingGroup> = owners.group().clone();
            let flow_id = flow.flow_id();
            root.admit(flow, default_priority_weight(priority));
            levels.push(PriorityLevel { owners, flow_id });
        }
        Ok(Arc::new(Self { root, levels }))
    }

    pub fn count_priorities(&self) -> u32 {
        self.levels.len() as u32
    }

    /// The owner tier of one priority class.
    pub fn get(&self, priority: u32) -> Option<KeyedFlows<OwnerId, OwnerQueues>> {
        self.levels
            .get(priority as usize)
            .map(|level| level.owners.clone())
    }

    /// Adjust a priority class's weight at runtime.
    pub fn set_priority_weight(&self, priority: u32, weight: u32) -> Result<(), SluiceError> {
        if weight == 0 {
            return Err(SluiceError::user_input("weights must be positive"));
        }
        let level = self.levels.get(priority as usize).ok_or_else(|| {
            SluiceError::user_input(format!("unknown priority class {priority}"))
        })?;
        self.root.set_weight(level.flow_id, weight);
        Ok(())
    }

    /// Resolve (creating on demand) the client queue a key addresses.
    pub fn queue_for(&self, key: &JobQueueKey) -> Result<Arc<ClientJobQueue>, SluiceError> {
        let level = self.levels.get(key.priority as usize).ok_or_else(|| {
            SluiceError::user_input(format!("unknown priority class {}", key.priority))
        })?;
        let owner = level.owners.get_or_add(&key.owner);
        Ok(owner.get_or_add(&key.name))
    }

    /// Non-blocking dequeue from the root, mainly for tests and draining.
    pub fn try_take(&self) -> Option<ScheduledItem> {
        SchedulingFlow::try_take(self.root.as_ref())
    }

    /// Wait for the next item from the root channel.
    pub async fn take(&self) -> ScheduledItem {
        self.root.take().await
    }

    /// Read-only per-queue statistics across the whole hierarchy.
    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        let mut snapshots = Vec::new();
        for level in &self.levels {
            for (owner, owner_queues) in level.owners.list_members() {
                for (name, queue) in owner_queues.list_queues() {
                    snapshots.push(QueueSnapshot {
                        owner,
                        priority: owner_queues.priority(),
                        name,
                        depth: queue.len(),
                        account: queue.stats(),
                    });
                }
            }
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn scheduler(priorities: u32) -> Arc<PriorityScheduler> {
        let expiry = ExpiryQueue::new(Duration::from_secs(60), 4);
        PriorityScheduler::new(priorities, expiry).unwrap()
    }

    fn key(owner: OwnerId, priority: u32, name: &str) -> JobQueueKey {
        JobQueueKey {
            owner,
            priority,
            name: name.to_string(),
        }
    }

    #[test]
    fn zero_priorities_is_rejected() {
        let expiry = ExpiryQueue::new(Duration::from_secs(60), 4);
        assert!(matches!(
            PriorityScheduler::new(0, expiry),
            Err(SluiceError::UserInput(_))
        ));
    }

    #[test]
    fn queue_for_builds_the_hierarchy_on_demand() {
        let scheduler = scheduler(2);
        let owner = Uuid::new_v4();

        let queue = scheduler.queue_for(&key(owner, 1, "reports")).unwrap();
        assert_eq!(queue.key().priority, 1);
        assert_eq!(queue.key().name, "reports");

        let again = scheduler.queue_for(&key(owner, 1, "reports")).unwrap();
        assert!(Arc::ptr_eq(&queue, &again));

        assert!(scheduler.queue_for(&key(owner, 2, "reports")).is_err());
    }

    #[test]
    fn default_weights_scale_with_priority() {
        assert_eq!(default_priority_weight(0), 10);
        assert_eq!(default_priority_weight(1), 20);
        assert_eq!(default_priority_weight(4), 50);
    }

    #[test]
    fn weight_adjustment_validates_its_inputs() {
        let scheduler = scheduler(2);
        assert!(scheduler.set_priority_weight(0, 25).is_ok());
        assert!(scheduler.set_priority_weight(0, 0).is_err());
        assert!(scheduler.set_priority_weight(7, 10).is_err());
    }

    #[test]
    fn snapshots_cover_every_queue() {
        let scheduler = scheduler(2);
        let owner = Uuid::new_v4();
        scheduler.queue_for(&key(owner, 0, "a")).unwrap();
        scheduler.queue_for(&key(owner, 1, "b")).unwrap();

        let snapshots = scheduler.queue_snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().any(|s| s.priority == 0 && s.name == "a"));
        assert!(snapshots.iter().any(|s| s.priority == 1 && s.name == "b"));
    }

    #[test]
    fn get_exposes_the_owner_tier() {
        let scheduler = scheduler(1);
        assert!(scheduler.get(0).is_some());
        assert!(scheduler.get(1).is_none());
    }
}
