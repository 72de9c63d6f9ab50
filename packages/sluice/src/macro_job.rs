//! Macro jobs: dequeue-time lazy expansion of one promise into many
//! micro-jobs, shared between concurrent clients and jointly cancellable.
//!
//! A [`MacroJob`] is the shared state for every client that submitted the
//! same batch request: the aggregate promise, the result-list builder, the
//! single-pass expansion sequence, and the participant roster. Each client
//! holds its own [`MacroJobMessage`] — its view of the shared job — queued
//! in its own client queue.
//!
//! The protocol balances three demands:
//!
//! 1. *Laziness.* Nothing expands until a participant is dequeued, and the
//!    sequence is never pulled twice: producers share one iterator and one
//!    produced-index, so a participant that takes over mid-run continues
//!    where the last one stopped.
//! 2. *Cancellation.* One client can withdraw without disturbing the rest;
//!    when the last one withdraws, the shared result is completed with
//!    cancellation — exactly once.
//! 3. *Disposal safety.* Messages are constructed speculatively and may be
//!    discarded before ever joining or running; `dispose` is safe on a
//!    never-enumerated instance and cleanup runs at most once.
//!
//! # Message state machine
//!
//! ```text
//! fresh (0) ──expand──▶ enumerating (1) ──completion/failure──▶ dead (-1)
//!    │                                                            ▲
//!    └────────── cancel / dispose / speculative drop ─────────────┘
//! ```
//!
//! Only the `0 → 1` transition grants the right to drive expansion. A call
//! while the state is `1` is a programmer error; `-1` short-circuits to an
//! empty sequence.

use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::cancellation::{CancellationPool, ClientToken, RentedCancellation};
use crate::client_queues::ClientJobQueue;
use crate::error::{JobError, JobErrorKind, SluiceError};
use crate::manager::{ClientRequestOwner, ExpansionIter, JobMessage, JobsManager};
use crate::promise::{Promise, PromiseOutcome, PromisePayload, SchemaCode};
use crate::promise_list::{ListCompletion, PromiseListBuilder};

const STATE_FRESH: i8 = 0;
const STATE_ENUMERATING: i8 = 1;
const STATE_DEAD: i8 = -1;

// =============================================================================
// Macro Job
// =============================================================================

struct ExpansionState {
    /// `None` once the sequence ended, failed, or was disposed.
    iter: Option<ExpansionIter>,
    /// Children registered so far; shared so interleaved producers keep
    /// `set_member` indices a contiguous prefix.
    produced: usize,
}

struct Roster {
    members: SmallVec<[Arc<MacroJobMessage>; 4]>,
    /// Authoritative membership count; `-1` is the terminal dead state that
    /// refuses new participants.
    count: isize,
}

pub(crate) enum RemoveOutcome {
    NotMember,
    Removed,
    /// This removal emptied the roster: the job is now dead.
    RemovedLast,
}

/// Shared state for a set of clients that submitted the same batch request.
pub struct MacroJob {
    promise: Arc<Promise>,
    builder: Arc<PromiseListBuilder>,
    expansion: Mutex<ExpansionState>,
    roster: Mutex<Roster>,
    pool: Arc<CancellationPool>,
}

impl MacroJob {
    pub(crate) fn new(
        promise: Arc<Promise>,
        expansion: ExpansionIter,
        pool: Arc<CancellationPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            promise,
            builder: PromiseListBuilder::new(),
            expansion: Mutex::new(ExpansionState {
                iter: Some(expansion),
                produced: 0,
            }),
            roster: Mutex::new(Roster {
                members: SmallVec::new(),
                count: 0,
            }),
            pool,
        })
    }

    pub fn promise(&self) -> &Arc<Promise> {
        &self.promise
    }

    pub fn promise_id(&self) -> crate::promise::PromiseId {
        self.promise.id()
    }

    pub(crate) fn builder(&self) -> &Arc<PromiseListBuilder> {
        &self.builder
    }

    /// Membership count observable. `-1` once the job is dead.
    pub fn participant_count(&self) -> isize {
        self.roster.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    /// Join a participant. Refused once the job is dead — callers observing
    /// `false` must build a fresh macro job for their request.
    pub fn add_participant(&self, message: &Arc<MacroJobMessage>) -> bool {
        let mut roster = self.roster.lock().unwrap_or_else(|e| e.into_inner());
        if roster.count < 0 {
            return false;
        }
        roster.members.push(message.clone());
        roster.count += 1;
        true
    }

    pub(crate) fn remove_participant(&self, message: &MacroJobMessage) -> RemoveOutcome {
        let mut roster = self.roster.lock().unwrap_or_else(|e| e.into_inner());
        let Some(position) = roster
            .members
            .iter()
            .position(|member| std::ptr::eq(Arc::as_ptr(member), message as *const _))
        else {
            return RemoveOutcome::NotMember;
        };
        roster.members.remove(position);
        roster.count -= 1;
        if roster.count == 0 {
            roster.count = -1;
            RemoveOutcome::RemovedLast
        } else {
            RemoveOutcome::Removed
        }
    }

    /// Authoritative group cancellation: cancel every participant.
    ///
    /// The membership is snapshotted first — cancellation removes members
    /// from the roster, so iterating the live list would skip neighbours.
    pub fn kill(&self, background: bool) {
        let snapshot: SmallVec<[Arc<MacroJobMessage>; 4]> = {
            let roster = self.roster.lock().unwrap_or_else(|e| e.into_inner());
            roster.members.clone()
        };
        debug!(promise_id = %self.promise.id(), participants = snapshot.len(), "killing macro job");
        for member in snapshot {
            member.cancel(background);
        }
    }

    pub(crate) fn produced(&self) -> usize {
        self.expansion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .produced
    }

    /// Whether the result list is sealed and every child promise resolved.
    /// Gates returning a rented cancellation source: until then, queued
    /// micro-jobs may still hold clones of its token.
    fn all_children_complete(&self) -> bool {
        self.builder.is_complete()
            && self
                .builder
                .members()
                .iter()
                .all(|child| child.is_complete())
    }

    /// Wait for every child promise, then complete the aggregate promise
    /// from the sealed result list.
    pub(crate) async fn finish(&self) {
        self.builder.wait_for_all().await;
        let outcome = match self.builder.completion() {
            Some(ListCompletion::Count(_)) => {
                let ids: Vec<String> = self
                    .builder
                    .members()
                    .iter()
                    .map(|child| child.id().to_string())
                    .collect();
                match serde_json::to_vec(&ids) {
                    Ok(body) => PromiseOutcome::Completed(PromisePayload::new(
                        SchemaCode::PROMISE_LIST,
                        body,
                    )),
                    Err(e) => PromiseOutcome::Failed(JobError::new(
                        JobErrorKind::Internal,
                        format!("failed to encode child list: {e}"),
                    )),
                }
            }
            Some(ListCompletion::Error(error)) => PromiseOutcome::Failed(error),
            Some(ListCompletion::Cancelled { token_id }) => {
                PromiseOutcome::Failed(JobError::cancelled(Some(token_id)))
            }
            None => return,
        };
        self.promise.try_complete(outcome);
    }
}

// =============================================================================
// Macro Job Message
// =============================================================================

struct MessageInner {
    cancelled: bool,
    rented: Option<RentedCancellation>,
    job_cancel: Option<CancellationToken>,
    watch: Option<JoinHandle<()>>,
}

/// One participant's view of a shared [`MacroJob`].
pub struct MacroJobMessage {
    source: Arc<MacroJob>,
    queue: Arc<ClientJobQueue>,
    client: ClientToken,
    manager: Weak<JobsManager>,
    state: AtomicI8,
    tracking: AtomicBool,
    cleaned: AtomicBool,
    inner: Mutex<MessageInner>,
}

impl MacroJobMessage {
    pub(crate) fn new(
        source: Arc<MacroJob>,
        queue: Arc<ClientJobQueue>,
        client: ClientToken,
        manager: Weak<JobsManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            queue,
            client,
            manager,
            state: AtomicI8::new(STATE_FRESH),
            tracking: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            inner: Mutex::new(MessageInner {
                cancelled: false,
                rented: None,
                job_cancel: None,
                watch: None,
            }),
        })
    }

    pub fn source(&self) -> &Arc<MacroJob> {
        &self.source
    }

    pub fn queue(&self) -> &Arc<ClientJobQueue> {
        &self.queue
    }

    pub fn client(&self) -> &ClientToken {
        &self.client
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_dead(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DEAD
    }

    /// Token of the current run's rented cancellation source, once the
    /// enumeration has armed it.
    pub fn job_cancel_token(&self) -> Option<CancellationToken> {
        self.lock().job_cancel.clone()
    }

    /// Register the `(promise, client)` pair with the jobs manager.
    ///
    /// Called after construction — the manager-side lookup needs the shared
    /// macro job to exist first. Between the successful registration and the
    /// flag store below, the message may be killed by another participant's
    /// cancellation; the acquire load of `state` after publishing the flag
    /// closes that window by backing the registration out again. A plain
    /// load is not enough on weakly-ordered machines.
    pub(crate) fn try_track_client_request(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let owner: Arc<dyn ClientRequestOwner> = self.clone();
        if !manager.try_register_client_request(self.source.promise.id(), &self.client, owner) {
            return false;
        }
        self.tracking.store(true, Ordering::Release);

        if self.state.load(Ordering::Acquire) != STATE_FRESH {
            if self.tracking.swap(false, Ordering::AcqRel) {
                manager.unregister_client_request(self.source.promise.id(), &self.client);
            }
            return false;
        }
        true
    }

    /// Cancel this participant. Idempotent.
    ///
    /// Swaps out the rented cancellation source and fires it — in the
    /// background when asked, so downstream handlers never run on the
    /// cancelling caller's thread — then disposes the message.
    pub fn cancel(&self, background: bool) {
        let rented = {
            let mut inner = self.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.rented.take()
        };
        trace!(promise_id = %self.source.promise.id(), client = self.client.id(), background, "macro participant cancelled");

        if let Some(rented) = rented {
            match (background, tokio::runtime::Handle::try_current()) {
                (true, Ok(handle)) => {
                    handle.spawn(async move { rented.fire() });
                }
                _ => rented.fire(),
            }
        }
        self.dispose();
    }

    /// Terminal cleanup. Safe on a never-enumerated instance and safe to
    /// call more than once; only the first call does work.
    pub fn dispose(&self) {
        self.state.swap(STATE_DEAD, Ordering::AcqRel);
        self.fail_if_only_producer();
    }

    /// Drive the shared expansion, handing every yielded micro-job to
    /// `sink` (which inserts it into the scheduling flow).
    ///
    /// Must run inside a tokio runtime: the run registers a client-token
    /// watch task and schedules the finish task on completion.
    pub fn expand(
        self: &Arc<Self>,
        sink: &mut dyn FnMut(JobMessage),
    ) -> Result<(), SluiceError> {
        match self.state.compare_exchange(
            STATE_FRESH,
            STATE_ENUMERATING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_DEAD) => return Ok(()),
            Err(_) => {
                return Err(SluiceError::SchedulingInvariant(
                    "a macro job message's expansion can only be pulled once",
                ))
            }
        }

        let builder = self.source.builder.clone();

        // Some sibling participant already produced the full result.
        if builder.is_complete() {
            self.dispose();
            return Ok(());
        }

        let Some(manager) = self.manager.upgrade() else {
            self.dispose();
            return Ok(());
        };

        let job_cancel = self.arm_run_cancellation();
        let mut expansion_error: Option<JobError> = None;

        loop {
            if job_cancel.is_cancelled() {
                break;
            }
            if builder.is_complete() {
                // Another producer finished while we were yielding.
                break;
            }

            let yielded = {
                let mut expansion = self
                    .source
                    .expansion
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let Some(iter) = expansion.iter.as_mut() else {
                    break;
                };
                match iter.next() {
                    None => {
                        // End of the sequence: dispose the shared iterator.
                        expansion.iter = None;
                        break;
                    }
                    Some(Err(error)) => {
                        expansion.iter = None;
                        expansion_error = Some(error);
                        break;
                    }
                    Some(Ok(item)) => {
                        // A cancellation that raced the advance: stop before
                        // registering the item.
                        if job_cancel.is_cancelled() {
                            break;
                        }
                        let (child, message) = manager.register_job_message(
                            self.queue.account().clone(),
                            item.retriever,
                            item.work,
                            None,
                            job_cancel.clone(),
                        );
                        let index = expansion.produced;
                        expansion.produced += 1;
                        builder.set_member(index, child);
                        // `None` means the child promise was already
                        // complete; nothing to schedule for it.
                        message
                    }
                }
            };
            if let Some(message) = yielded {
                sink(message);
            }
        }

        let produced = self.source.produced();

        if expansion_error.is_none() && job_cancel.is_cancelled() {
            self.state.store(STATE_DEAD, Ordering::Release);
            self.fail_if_only_producer();
            return Ok(());
        }

        let sealed_now = builder.try_complete(produced, expansion_error);
        self.state.store(STATE_DEAD, Ordering::Release);
        if sealed_now {
            debug!(
                promise_id = %self.source.promise.id(),
                produced,
                "macro expansion sealed"
            );
            // Wait out every child, complete the aggregate, then clean up
            // this participant.
            let source = self.source.clone();
            let this = self.clone();
            tokio::spawn(async move {
                source.finish().await;
                this.dispose();
            });
        } else {
            self.dispose();
        }
        Ok(())
    }

    /// Step 2 of the run: rent a cancellation source for this run and wire
    /// the client token to a background cancel. Short-circuits with an
    /// already-fired token when the participant is cancelled before it ever
    /// ran.
    fn arm_run_cancellation(self: &Arc<Self>) -> CancellationToken {
        let mut inner = self.lock();
        if inner.cancelled || self.client.is_cancelled() {
            let token = CancellationToken::new();
            token.cancel();
            return token;
        }

        let rented = self.source.pool.rent();
        let token = rented.token().clone();
        inner.rented = Some(rented);
        inner.job_cancel = Some(token.clone());

        let weak = Arc::downgrade(self);
        let client = self.client.clone();
        inner.watch = Some(tokio::spawn(async move {
            client.cancelled().await;
            if let Some(message) = weak.upgrade() {
                message.cancel(true);
            }
        }));
        token
    }

    /// Withdraw this participant; only the last one out completes the
    /// shared result with cancellation. The one-shot builder makes the
    /// completion a no-op when some producer already sealed it.
    fn fail_if_only_producer(&self) {
        if !self.basic_clean_up() {
            return;
        }
        if self
            .source
            .builder
            .try_complete_cancelled(self.client.id())
        {
            debug!(
                promise_id = %self.source.promise.id(),
                client = self.client.id(),
                "last participant withdrew; result completed with cancellation"
            );
            self.source.promise.try_complete(PromiseOutcome::Failed(
                JobError::cancelled(Some(self.client.id())),
            ));
        }
    }

    /// The ordered cleanup. Returns `true` when this call removed the last
    /// participant.
    fn basic_clean_up(&self) -> bool {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return false;
        }

        // 1. Release the client-token watch registration.
        let (watch, rented) = {
            let mut inner = self.lock();
            (inner.watch.take(), inner.rented.take())
        };
        if let Some(watch) = watch {
            watch.abort();
        }
        // A triggered source must never return to the pool, and an
        // untriggered one may only return once no queued micro-job can
        // still hold a clone of its token; otherwise it is simply dropped.
        if let Some(rented) = rented {
            if !rented.token().is_cancelled() && self.source.all_children_complete() {
                if let Err(e) = self.source.pool.give_back(rented) {
                    error!(promise_id = %self.source.promise.id(), error = %e, "cancellation source not returned");
                }
            }
        }

        // 2. Drop the jobs-manager client tracking.
        if self.tracking.swap(false, Ordering::AcqRel) {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister_client_request(self.source.promise.id(), &self.client);
            }
        }

        // 3. Leave the roster; the last one out retires the macro job.
        match self.source.remove_participant(self) {
            RemoveOutcome::RemovedLast => {
                if let Some(manager) = self.manager.upgrade() {
                    manager.unregister_macro_job(self.source.promise.id());
                }
                true
            }
            RemoveOutcome::Removed | RemoveOutcome::NotMember => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MessageInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ClientRequestOwner for MacroJobMessage {
    fn cancel_for_client(&self, client: &ClientToken, background: bool) {
        if *client == self.client {
            self.cancel(background);
        }
    }

    fn kill(&self, background: bool) {
        self.source.kill(background);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::SchemaRegistry;
    use crate::cancellation::CancellationPool;
    use crate::client_queues::{ExpiryQueue, JobQueueKey};
    use crate::manager::{ExpansionItem, PromiseRetriever, WorkDescriptor};
    use crate::priority::PriorityScheduler;
    use crate::store::PromiseStore;
    use crate::storage::MemoryBlobStore;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    fn harness() -> (Arc<JobsManager>, Arc<ClientJobQueue>) {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas.register(crate::promise::SchemaCode(1), "test-payload");
        let store = PromiseStore::new(1, Arc::new(MemoryBlobStore::new()), schemas);
        let expiry = ExpiryQueue::new(Duration::from_secs(60), 4);
        let scheduler = PriorityScheduler::new(1, expiry).unwrap();
        let manager = JobsManager::new(store, scheduler, Arc::new(CancellationPool::new()));
        let queue = manager
            .scheduler()
            .queue_for(&JobQueueKey {
                owner: Uuid::new_v4(),
                priority: 0,
                name: "macro".to_string(),
            })
            .unwrap();
        (manager, queue)
    }

    fn expansion_of(count: usize) -> ExpansionIter {
        Box::new((0..count).map(|_| {
            let retriever: PromiseRetriever =
                Box::new(|store: &Arc<PromiseStore>| store.create(None, None));
            Ok(ExpansionItem {
                retriever,
                work: WorkDescriptor::new("child"),
            })
        }))
    }

    fn macro_job(manager: &Arc<JobsManager>, count: usize) -> Arc<MacroJob> {
        let promise = manager.store().create(None, None);
        MacroJob::new(
            promise,
            expansion_of(count),
            manager.cancellation_pool().clone(),
        )
    }

    #[tokio::test]
    async fn participants_join_and_leave_until_dead() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 0);

        let a = MacroJobMessage::new(job.clone(), queue.clone(), ClientToken::new(), Arc::downgrade(&manager));
        let b = MacroJobMessage::new(job.clone(), queue.clone(), ClientToken::new(), Arc::downgrade(&manager));
        assert!(job.add_participant(&a));
        assert!(job.add_participant(&b));
        assert_eq!(job.participant_count(), 2);

        a.dispose();
        assert_eq!(job.participant_count(), 1);
        b.dispose();
        assert_eq!(job.participant_count(), -1);

        // Dead jobs refuse new participants: the caller must build a fresh
        // macro job.
        let c = MacroJobMessage::new(job.clone(), queue, ClientToken::new(), Arc::downgrade(&manager));
        assert!(!job.add_participant(&c));
    }

    #[tokio::test]
    async fn dispose_is_safe_on_a_never_joined_message() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 0);

        let speculative =
            MacroJobMessage::new(job.clone(), queue, ClientToken::new(), Arc::downgrade(&manager));
        // Never joined: cleanup finds no roster entry and must not panic or
        // flip the job dead.
        speculative.dispose();
        speculative.dispose();
        assert_eq!(job.participant_count(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 3);
        let message =
            MacroJobMessage::new(job.clone(), queue, ClientToken::new(), Arc::downgrade(&manager));
        assert!(job.add_participant(&message));

        message.cancel(false);
        message.cancel(false);
        assert!(message.is_cancelled());
        assert!(message.is_dead());
        assert_eq!(job.participant_count(), -1);

        // The sole participant withdrew: the result carries cancellation.
        assert!(job.builder().is_complete());
        assert!(matches!(
            job.builder().completion(),
            Some(ListCompletion::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn kill_cancels_every_participant() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 2);
        let a = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        let b = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&a));
        assert!(job.add_participant(&b));

        job.kill(false);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(job.participant_count(), -1);
        assert!(matches!(
            job.builder().completion(),
            Some(ListCompletion::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn tracking_backs_out_when_the_message_died_mid_registration() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 1);
        let message =
            MacroJobMessage::new(job.clone(), queue, ClientToken::new(), Arc::downgrade(&manager));
        assert!(job.add_participant(&message));

        // The message dies between the manager-side registration and the
        // tracking flag becoming visible.
        message.dispose();
        assert!(!message.try_track_client_request());

        // The registration was backed out, so the pair is free again.
        assert!(manager.try_register_client_request(
            job.promise_id(),
            message.client(),
            message.clone()
        ));
    }

    #[tokio::test]
    async fn expansion_yields_every_item_and_seals_the_list() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 3);
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        let mut yielded = Vec::new();
        message
            .expand(&mut |job_message| yielded.push(job_message))
            .unwrap();
        assert_eq!(yielded.len(), 3);
        assert!(job.builder().is_complete());
        assert!(matches!(
            job.builder().completion(),
            Some(ListCompletion::Count(3))
        ));

        // Children complete; the aggregate promise resolves to the id list.
        for child in job.builder().members() {
            child.try_complete(PromiseOutcome::Completed(PromisePayload::new(
                crate::promise::SchemaCode(1),
                &b"ok"[..],
            )));
        }
        tokio::time::timeout(Duration::from_secs(5), job.promise().completed())
            .await
            .expect("aggregate completes");
        let outcome = job.promise().outcome().unwrap();
        let ids: Vec<String> =
            serde_json::from_slice(&outcome.payload().unwrap().body).unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn second_pull_of_a_running_expansion_is_refused() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 1);
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        let reentrant = Arc::new(StdMutex::new(None));
        let observed = reentrant.clone();
        let inner = message.clone();
        message
            .expand(&mut move |_job| {
                let result = inner.expand(&mut |_| {});
                *observed.lock().unwrap() = Some(result);
            })
            .unwrap();

        let taken = reentrant.lock().unwrap().take();
        match taken {
            Some(Err(SluiceError::SchedulingInvariant(_))) => {}
            other => panic!("expected an invariant violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_dequeue_expands_to_nothing() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 3);
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        message.cancel(false);
        let mut yielded = 0usize;
        message.expand(&mut |_job| yielded += 1).unwrap();
        assert_eq!(yielded, 0);
        assert_eq!(job.produced(), 0);
    }

    #[tokio::test]
    async fn empty_expansion_completes_immediately_with_zero_count() {
        let (manager, queue) = harness();
        let job = macro_job(&manager, 0);
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        message.expand(&mut |_job| {}).unwrap();
        assert!(matches!(
            job.builder().completion(),
            Some(ListCompletion::Count(0))
        ));
        tokio::time::timeout(Duration::from_secs(5), job.promise().completed())
            .await
            .expect("empty list completes the aggregate");
    }

    #[tokio::test]
    async fn failing_expansion_seals_the_list_with_the_error() {
        let (manager, queue) = harness();
        let promise = manager.store().create(None, None);
        let failing: ExpansionIter = Box::new(
            vec![Err(JobError::new(JobErrorKind::Execution, "bad step"))].into_iter(),
        );
        let job = MacroJob::new(
            promise,
            failing,
            manager.cancellation_pool().clone(),
        );
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        message.expand(&mut |_job| {}).unwrap();
        assert!(matches!(
            job.builder().completion(),
            Some(ListCompletion::Error(_))
        ));
        tokio::time::timeout(Duration::from_secs(5), job.promise().completed())
            .await
            .expect("error completes the aggregate");
        assert!(job.promise().outcome().unwrap().is_failure());
    }

    #[tokio::test]
    async fn rented_source_returns_to_the_pool_after_a_clean_run() {
        let (manager, queue) = harness();
        let pool = manager.cancellation_pool().clone();
        let job = macro_job(&manager, 1);
        let message = MacroJobMessage::new(
            job.clone(),
            queue.clone(),
            ClientToken::new(),
            Arc::downgrade(&manager),
        );
        assert!(job.add_participant(&message));

        message.expand(&mut |_job| {}).unwrap();
        for child in job.builder().members() {
            child.try_complete(PromiseOutcome::Completed(PromisePayload::new(
                crate::promise::SchemaCode(1),
                &b"ok"[..],
            )));
        }
        tokio::time::timeout(Duration::from_secs(5), job.promise().completed())
            .await
            .unwrap();

        // The finish task runs cleanup; poll briefly for the give-back.
        for _ in 0..50 {
            if pool.idle_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("rented source was not returned to the pool");
    }
}
