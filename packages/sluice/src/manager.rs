//! The jobs manager: the registry of live work.
//!
//! Everything a client submits flows through here. The manager deduplicates
//! requests onto shared promises, installs micro-job messages into client
//! queues, joins participants onto shared macro jobs, and routes
//! cancellation from `(promise, client)` pairs to whatever owns the work.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancellation::{CancellationPool, ClientToken};
use crate::client_queues::JobQueueKey;
use crate::error::{JobError, SluiceError};
use crate::flow::{ScheduledItem, SchedulingAccount, DEFAULT_CHARGE};
use crate::macro_job::{MacroJob, MacroJobMessage};
use crate::priority::PriorityScheduler;
use crate::promise::{Promise, PromiseId, PromisePayload};
use crate::store::PromiseStore;

// =============================================================================
// Work
// =============================================================================

/// Describes one unit of work for the (out-of-scope) worker.
#[derive(Clone, Debug)]
pub struct WorkDescriptor {
    /// Worker-facing route, e.g. `"render:tile"`.
    pub job_type: String,
    /// Opaque request payload handed to the worker.
    pub payload: Option<PromisePayload>,
    /// Charge estimate used by the fair scheduler; the dispatcher posts the
    /// measured difference after execution.
    pub initial_charge: i64,
}

impl WorkDescriptor {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: None,
            initial_charge: DEFAULT_CHARGE,
        }
    }

    pub fn with_payload(mut self, payload: PromisePayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// An individually launchable micro-job.
pub struct JobMessage {
    pub promise: Arc<Promise>,
    pub work: WorkDescriptor,
    pub account: SchedulingAccount,
    pub cancel: CancellationToken,
}

/// Obtains or creates the promise a piece of work targets.
pub type PromiseRetriever = Box<dyn FnOnce(&Arc<PromiseStore>) -> Arc<Promise> + Send>;

/// One step of a macro job's lazy expansion.
pub struct ExpansionItem {
    pub retriever: PromiseRetriever,
    pub work: WorkDescriptor,
}

/// The lazy, single-pass expansion sequence of a macro job. An `Err` item
/// aborts expansion and seals the result list with the error.
pub type ExpansionIter = Box<dyn Iterator<Item = Result<ExpansionItem, JobError>> + Send>;

/// Builds a fresh expansion sequence. Invoked once per [`MacroJob`]; the
/// retry loop in [`JobsManager::enqueue_macro_job`] may need a second
/// sequence when it loses a resurrection race.
pub type ExpansionFactory = Box<dyn Fn() -> ExpansionIter + Send + Sync>;

// =============================================================================
// Cancellation Routing
// =============================================================================

/// The entity a `(promise, client)` registration routes cancellation to.
pub trait ClientRequestOwner: Send + Sync {
    /// Withdraw one client's interest without disturbing others.
    fn cancel_for_client(&self, client: &ClientToken, background: bool);

    /// Authoritative group cancellation of the whole piece of work.
    fn kill(&self, background: bool);
}

/// Owner registered for a plain micro-job: cancellation just fires the
/// job's own token.
struct MicroJobOwner {
    client: ClientToken,
    cancel: CancellationToken,
}

impl ClientRequestOwner for MicroJobOwner {
    fn cancel_for_client(&self, client: &ClientToken, _background: bool) {
        if *client == self.client {
            self.cancel.cancel();
        }
    }

    fn kill(&self, _background: bool) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Jobs Manager
// =============================================================================

/// Registry of live work: deduplication, installation, cancellation routing.
pub struct JobsManager {
    store: Arc<PromiseStore>,
    scheduler: Arc<PriorityScheduler>,
    pool: Arc<CancellationPool>,
    macro_jobs: DashMap<PromiseId, Arc<MacroJob>>,
    client_requests: DashMap<(PromiseId, u64), Arc<dyn ClientRequestOwner>>,
}

impl JobsManager {
    pub fn new(
        store: Arc<PromiseStore>,
        scheduler: Arc<PriorityScheduler>,
        pool: Arc<CancellationPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            pool,
            macro_jobs: DashMap::new(),
            client_requests: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<PromiseStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub(crate) fn cancellation_pool(&self) -> &Arc<CancellationPool> {
        &self.pool
    }

    /// Build the micro-job message for a piece of work, or nothing when its
    /// promise is already complete.
    ///
    /// When `register_client` is given, the `(promise, client)` pair is
    /// recorded for cancellation routing and released again once the
    /// promise completes.
    pub fn register_job_message(
        self: &Arc<Self>,
        account: SchedulingAccount,
        retriever: PromiseRetriever,
        work: WorkDescriptor,
        register_client: Option<&ClientToken>,
        cancel: CancellationToken,
    ) -> (Arc<Promise>, Option<JobMessage>) {
        let promise = retriever(&self.store);
        if promise.is_complete() {
            return (promise, None);
        }

        let message = JobMessage {
            promise: promise.clone(),
            work,
            account,
            cancel,
        };

        if let Some(client) = register_client {
            let owner = Arc::new(MicroJobOwner {
                client: client.clone(),
                cancel: message.cancel.clone(),
            });
            if self.try_register_client_request(promise.id(), client, owner) {
                let manager = Arc::downgrade(self);
                let client = client.clone();
                promise.subscribe(Box::new(move |completed| {
                    if let Some(manager) = manager.upgrade() {
                        manager.unregister_client_request(completed.id(), &client);
                    }
                }));
            }
        }

        (promise, Some(message))
    }

    /// Record `(promise, client) → owner` for cancellation routing. Fails
    /// when the pair is already registered.
    pub fn try_register_client_request(
        &self,
        promise_id: PromiseId,
        client: &ClientToken,
        owner: Arc<dyn ClientRequestOwner>,
    ) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.client_requests.entry((promise_id, client.id())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(owner);
                true
            }
        }
    }

    pub fn unregister_client_request(&self, promise_id: PromiseId, client: &ClientToken) {
        self.client_requests.remove(&(promise_id, client.id()));
    }

    /// Called when a macro job transitions to dead.
    pub fn unregister_macro_job(&self, promise_id: PromiseId) {
        if self.macro_jobs.remove(&promise_id).is_some() {
            debug!(promise_id = %promise_id, "macro job unregistered");
        }
    }

    /// The live macro job for an aggregate promise, if any. Observability
    /// and dedup both read through this.
    pub fn macro_job(&self, promise_id: PromiseId) -> Option<Arc<MacroJob>> {
        self.macro_jobs.get(&promise_id).map(|entry| entry.clone())
    }

    pub fn macro_job_count(&self) -> usize {
        self.macro_jobs.len()
    }

    /// Withdraw one client's interest in a promise. Returns whether a
    /// registration was found.
    pub fn cancel_job(&self, promise_id: PromiseId, client: &ClientToken, background: bool) -> bool {
        let Some(owner) = self
            .client_requests
            .get(&(promise_id, client.id()))
            .map(|entry| entry.clone())
        else {
            return false;
        };
        debug!(promise_id = %promise_id, client = client.id(), background, "routing client cancellation");
        owner.cancel_for_client(client, background);
        true
    }

    /// Authoritative cancellation of everything attached to a promise.
    pub fn kill(&self, promise_id: PromiseId, background: bool) -> bool {
        if let Some(job) = self.macro_jobs.get(&promise_id).map(|entry| entry.clone()) {
            debug!(promise_id = %promise_id, background, "killing macro job");
            job.kill(background);
            return true;
        }

        let owners: Vec<Arc<dyn ClientRequestOwner>> = self
            .client_requests
            .iter()
            .filter(|entry| entry.key().0 == promise_id)
            .map(|entry| entry.value().clone())
            .collect();
        if owners.is_empty() {
            return false;
        }
        debug!(promise_id = %promise_id, count = owners.len(), background, "killing registered work");
        for owner in owners {
            owner.kill(background);
        }
        true
    }

    // =========================================================================
    // Submission surface
    // =========================================================================

    /// Install a single micro-job into the addressed client queue.
    ///
    /// Returns the target promise; when it was already complete no message
    /// is queued.
    pub fn enqueue_job(
        self: &Arc<Self>,
        key: &JobQueueKey,
        retriever: PromiseRetriever,
        work: WorkDescriptor,
        client: Option<&ClientToken>,
    ) -> Result<Arc<Promise>, SluiceError> {
        let queue = self.scheduler.queue_for(key)?;
        // Client-scoped cancellation must not take the whole queue down, so
        // registered jobs get a child of the group token.
        let cancel = match client {
            Some(_) => queue.cancel_token().child_token(),
            None => queue.cancel_token().clone(),
        };
        let (promise, message) =
            self.register_job_message(queue.account().clone(), retriever, work, client, cancel);
        if let Some(message) = message {
            queue.enqueue(ScheduledItem::Job(message));
        }
        Ok(promise)
    }

    /// Install a macro-job request, deduplicating onto a live shared macro
    /// job when one exists for the same aggregate promise.
    ///
    /// The join can race with the shared job dying: `add_participant`
    /// refuses once the participant count has fallen to the dead state, in
    /// which case the stale registry entry is retired and a fresh macro job
    /// is built from the expansion factory.
    pub fn enqueue_macro_job(
        self: &Arc<Self>,
        key: &JobQueueKey,
        retriever: PromiseRetriever,
        expansion: ExpansionFactory,
        client: &ClientToken,
    ) -> Result<Arc<Promise>, SluiceError> {
        let queue = self.scheduler.queue_for(key)?;
        let promise = retriever(&self.store);
        if promise.is_complete() {
            return Ok(promise);
        }

        loop {
            // The candidate is built before touching the registry so no user
            // code (the expansion factory) runs under a map shard lock. On a
            // dedup hit the candidate is simply discarded.
            let candidate = MacroJob::new(promise.clone(), expansion(), self.pool.clone());
            let job = self
                .macro_jobs
                .entry(promise.id())
                .or_insert(candidate)
                .value()
                .clone();

            let message =
                MacroJobMessage::new(job.clone(), queue.clone(), client.clone(), Arc::downgrade(self));
            if job.add_participant(&message) {
                message.try_track_client_request();
                queue.enqueue(ScheduledItem::Macro(message));
                return Ok(promise);
            }

            // Dead between lookup and join: retire the stale entry (only if
            // it is still the instance we raced against) and go again.
            self.macro_jobs
                .remove_if(&promise.id(), |_, existing| Arc::ptr_eq(existing, &job));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::SchemaRegistry;
    use crate::client_queues::ExpiryQueue;
    use crate::promise::{PromiseOutcome, SchemaCode};
    use crate::storage::MemoryBlobStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn manager() -> Arc<JobsManager> {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas.register(SchemaCode(1), "test-payload");
        let store = PromiseStore::new(1, Arc::new(MemoryBlobStore::new()), schemas);
        let expiry = ExpiryQueue::new(Duration::from_secs(60), 4);
        let scheduler = PriorityScheduler::new(2, expiry).unwrap();
        JobsManager::new(store, scheduler, Arc::new(CancellationPool::new()))
    }

    fn key(name: &str) -> JobQueueKey {
        JobQueueKey {
            owner: Uuid::nil(),
            priority: 0,
            name: name.to_string(),
        }
    }

    fn fresh_retriever() -> PromiseRetriever {
        Box::new(|store: &Arc<PromiseStore>| store.create(None, None))
    }

    #[test]
    fn complete_promise_produces_no_message() {
        let manager = manager();
        let retriever: PromiseRetriever = Box::new(|store: &Arc<PromiseStore>| {
            store.create(
                None,
                Some(PromiseOutcome::Completed(PromisePayload::new(
                    SchemaCode(1),
                    &b"done"[..],
                ))),
            )
        });
        let (promise, message) = manager.register_job_message(
            SchedulingAccount::new(),
            retriever,
            WorkDescriptor::new("noop"),
            None,
            CancellationToken::new(),
        );
        assert!(promise.is_complete());
        assert!(message.is_none());
    }

    #[test]
    fn client_request_registration_is_exclusive_per_pair() {
        let manager = manager();
        let promise = manager.store().create(None, None);
        let client = ClientToken::new();
        let owner: Arc<dyn ClientRequestOwner> = Arc::new(MicroJobOwner {
            client: client.clone(),
            cancel: CancellationToken::new(),
        });

        assert!(manager.try_register_client_request(promise.id(), &client, owner.clone()));
        assert!(!manager.try_register_client_request(promise.id(), &client, owner.clone()));

        // A different client may register against the same promise.
        let other = ClientToken::new();
        assert!(manager.try_register_client_request(promise.id(), &other, owner.clone()));

        manager.unregister_client_request(promise.id(), &client);
        assert!(manager.try_register_client_request(promise.id(), &client, owner));
    }

    #[test]
    fn enqueue_job_installs_into_the_addressed_queue() {
        let manager = manager();
        let queue_key = key("ingest");
        let promise = manager
            .enqueue_job(&queue_key, fresh_retriever(), WorkDescriptor::new("work"), None)
            .unwrap();
        assert!(!promise.is_complete());

        let queue = manager.scheduler().queue_for(&queue_key).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn enqueue_job_rejects_unknown_priority() {
        let manager = manager();
        let bad = JobQueueKey {
            owner: Uuid::nil(),
            priority: 99,
            name: "nope".to_string(),
        };
        match manager.enqueue_job(&bad, fresh_retriever(), WorkDescriptor::new("work"), None) {
            Err(SluiceError::UserInput(message)) => assert!(message.contains("priority")),
            other => panic!("expected user input error, got {other:?}"),
        }
    }

    #[test]
    fn cancel_job_routes_to_the_registered_micro_job() {
        let manager = manager();
        let queue_key = key("cancellable");
        let client = ClientToken::new();
        let promise = manager
            .enqueue_job(
                &queue_key,
                fresh_retriever(),
                WorkDescriptor::new("work"),
                Some(&client),
            )
            .unwrap();

        let queue = manager.scheduler().queue_for(&queue_key).unwrap();
        assert!(!queue.cancel_token().is_cancelled());

        assert!(manager.cancel_job(promise.id(), &client, false));
        // The queue's group token is untouched; only the job's child token
        // fired.
        assert!(!queue.cancel_token().is_cancelled());

        // Unknown registrations report false.
        assert!(!manager.cancel_job(promise.id(), &ClientToken::new(), false));
    }

    #[test]
    fn kill_routes_to_every_registration_for_the_promise() {
        let manager = manager();
        let queue_key = key("killable");
        let client = ClientToken::new();
        let promise = manager
            .enqueue_job(
                &queue_key,
                fresh_retriever(),
                WorkDescriptor::new("work"),
                Some(&client),
            )
            .unwrap();

        assert!(manager.kill(promise.id(), false));
        // Nothing registered under an unknown promise.
        assert!(!manager.kill(PromiseId::new(9, 9), false));
    }

    #[test]
    fn completion_releases_the_client_registration() {
        let manager = manager();
        let queue_key = key("released");
        let client = ClientToken::new();
        let promise = manager
            .enqueue_job(
                &queue_key,
                fresh_retriever(),
                WorkDescriptor::new("work"),
                Some(&client),
            )
            .unwrap();

        promise.try_complete(PromiseOutcome::Completed(PromisePayload::new(
            SchemaCode(1),
            &b"x"[..],
        )));
        assert!(!manager.cancel_job(promise.id(), &client, false));
    }
}
