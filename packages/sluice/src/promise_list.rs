//! Ordered accumulator for the child promises of a macro job.
//!
//! Producers place children by index as the shared expansion advances; the
//! builder is completed exactly once, with a final count, an error, or a
//! cancellation record. Completion freezes membership. Waiting for every
//! child is separate from completion: the member list can be sealed while
//! children are still being computed.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::JobError;
use crate::promise::Promise;

/// How a promise list was sealed.
#[derive(Clone, Debug)]
pub enum ListCompletion {
    /// All `count` children were produced.
    Count(usize),
    /// Expansion failed after producing some prefix of children.
    Error(JobError),
    /// Every producer withdrew; carries the identity of the last client
    /// token involved.
    Cancelled { token_id: u64 },
}

struct ListState {
    members: Vec<Option<Arc<Promise>>>,
    completion: Option<ListCompletion>,
}

/// Promise-list accumulator shared by all participants of one macro job.
pub struct PromiseListBuilder {
    state: Mutex<ListState>,
    sealed: Notify,
}

impl PromiseListBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ListState {
                members: Vec::new(),
                completion: None,
            }),
            sealed: Notify::new(),
        })
    }

    /// Place the child at `index`. Ignored after completion: a late producer
    /// that lost the completion race must not grow a sealed list.
    pub fn set_member(&self, index: usize, promise: Arc<Promise>) {
        let mut state = self.lock();
        if state.completion.is_some() {
            return;
        }
        if state.members.len() <= index {
            state.members.resize_with(index + 1, || None);
        }
        state.members[index] = Some(promise);
    }

    /// Seal the list with a final count, or an error when one occurred.
    /// Returns `true` only for the call that performed the transition.
    pub fn try_complete(&self, count: usize, error: Option<JobError>) -> bool {
        let completion = match error {
            Some(error) => ListCompletion::Error(error),
            None => ListCompletion::Count(count),
        };
        self.seal(completion)
    }

    /// Seal the list with a cancellation record. Used by the last producer
    /// to withdraw.
    pub fn try_complete_cancelled(&self, token_id: u64) -> bool {
        self.seal(ListCompletion::Cancelled { token_id })
    }

    pub fn is_complete(&self) -> bool {
        self.lock().completion.is_some()
    }

    pub fn completion(&self) -> Option<ListCompletion> {
        self.lock().completion.clone()
    }

    /// Children placed so far, in index order, holes elided.
    pub fn members(&self) -> Vec<Arc<Promise>> {
        self.lock().members.iter().flatten().cloned().collect()
    }

    /// Wait until the builder is sealed, then until every member promise is
    /// complete.
    pub async fn wait_for_all(&self) {
        loop {
            let notified = self.sealed.notified();
            if self.is_complete() {
                break;
            }
            notified.await;
        }
        for member in self.members() {
            member.completed().await;
        }
    }

    fn seal(&self, completion: ListCompletion) -> bool {
        {
            let mut state = self.lock();
            if state.completion.is_some() {
                return false;
            }
            state.completion = Some(completion);
        }
        self.sealed.notify_waiters();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
