//! Promises: first-class identities for future or completed computation
//! results.
//!
//! A [`Promise`] is the deduplication target of the whole server: many client
//! requests can converge on one promise, and its completed payload is what
//! eventually gets shed to the blob store. The type is deliberately small:
//! identity, an optional input payload, a complete-once outcome slot, and a
//! set of update subscribers that fire exactly once on the transition to
//! completed.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{JobError, SluiceError};

// =============================================================================
// Identity
// =============================================================================

/// Opaque promise identity: `(service_id, sequence)`, unique within a server
/// instance and totally ordered.
///
/// Display form is `"<service_id>/<sequence>"` in decimal and round-trips
/// through [`FromStr`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PromiseId {
    pub service_id: u32,
    pub sequence: u64,
}

/// Length of the fixed KV key encoding: 4 bytes of service id plus 8 bytes
/// of sequence, both little-endian.
pub const PROMISE_KEY_LEN: usize = 12;

impl PromiseId {
    pub fn new(service_id: u32, sequence: u64) -> Self {
        Self {
            service_id,
            sequence,
        }
    }

    /// Fixed 12-byte little-endian key used by the blob store.
    pub fn to_key_bytes(self) -> [u8; PROMISE_KEY_LEN] {
        let mut key = [0u8; PROMISE_KEY_LEN];
        key[..4].copy_from_slice(&self.service_id.to_le_bytes());
        key[4..].copy_from_slice(&self.sequence.to_le_bytes());
        key
    }

    /// Decode a key previously produced by [`Self::to_key_bytes`].
    pub fn from_key_bytes(key: &[u8]) -> Option<Self> {
        if key.len() != PROMISE_KEY_LEN {
            return None;
        }
        let service_id = u32::from_le_bytes(key[..4].try_into().ok()?);
        let sequence = u64::from_le_bytes(key[4..].try_into().ok()?);
        Some(Self {
            service_id,
            sequence,
        })
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.sequence)
    }
}

impl FromStr for PromiseId {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, sequence) = s
            .split_once('/')
            .ok_or_else(|| SluiceError::user_input(format!("malformed promise id: {s:?}")))?;
        let service_id = service
            .parse::<u32>()
            .map_err(|_| SluiceError::user_input(format!("malformed promise id: {s:?}")))?;
        let sequence = sequence
            .parse::<u64>()
            .map_err(|_| SluiceError::user_input(format!("malformed promise id: {s:?}")))?;
        Ok(Self {
            service_id,
            sequence,
        })
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Application-defined schema tag carried alongside every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaCode(pub u32);

impl SchemaCode {
    /// Reserved: the payload body is a serialized [`JobError`].
    pub const JOB_ERROR: SchemaCode = SchemaCode(u32::MAX);
    /// Reserved: the payload body is an ordered list of child promise ids.
    pub const PROMISE_LIST: SchemaCode = SchemaCode(u32::MAX - 1);

    pub fn is_reserved(self) -> bool {
        self == Self::JOB_ERROR || self == Self::PROMISE_LIST
    }
}

impl fmt::Display for SchemaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema#{}", self.0)
    }
}

/// Schema-tagged opaque bytes. The core never interprets the body except for
/// the reserved schemas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromisePayload {
    pub schema: SchemaCode,
    pub body: Bytes,
}

impl PromisePayload {
    pub fn new(schema: SchemaCode, body: impl Into<Bytes>) -> Self {
        Self {
            schema,
            body: body.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// The definitive result of a promise: either a payload or a job failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseOutcome {
    Completed(PromisePayload),
    Failed(JobError),
}

impl PromiseOutcome {
    pub fn payload(&self) -> Option<&PromisePayload> {
        match self {
            Self::Completed(payload) => Some(payload),
            Self::Failed(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// View the outcome as a result. A cancellation failure surfaces as
    /// [`SluiceError::Cancelled`] carrying the triggering token identity,
    /// so callers can tell their own cancellation from a foreign one.
    pub fn as_result(&self) -> Result<&PromisePayload, SluiceError> {
        match self {
            Self::Completed(payload) => Ok(payload),
            Self::Failed(error) if error.is_cancellation() => Err(SluiceError::Cancelled {
                token_id: error.token_id.unwrap_or(0),
            }),
            Self::Failed(error) => Err(SluiceError::Execution(error.clone())),
        }
    }
}

// =============================================================================
// Promise
// =============================================================================

/// Callback invoked exactly once when a promise transitions to completed.
pub type UpdateSubscriber = Box<dyn FnOnce(&Arc<Promise>) + Send>;

struct PromiseState {
    input: Option<PromisePayload>,
    outcome: Option<PromiseOutcome>,
    subscribers: Vec<UpdateSubscriber>,
}

/// A first-class identity for a future or completed computation result.
///
/// Once completed, a promise never reverts: the outcome slot is set exactly
/// once, subscribers observe the transition exactly once, and
/// [`Promise::completed`] resolves for every waiter past and future.
pub struct Promise {
    id: PromiseId,
    state: Mutex<PromiseState>,
    done: Notify,
}

impl Promise {
    pub(crate) fn new(id: PromiseId, input: Option<PromisePayload>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(PromiseState {
                input,
                outcome: None,
                subscribers: Vec::new(),
            }),
            done: Notify::new(),
        })
    }

    /// Rebuild a completed promise from its persisted outcome.
    pub(crate) fn rehydrated(id: PromiseId, outcome: PromiseOutcome) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(PromiseState {
                input: None,
                outcome: Some(outcome),
                subscribers: Vec::new(),
            }),
            done: Notify::new(),
        })
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn input(&self) -> Option<PromisePayload> {
        self.lock().input.clone()
    }

    pub fn outcome(&self) -> Option<PromiseOutcome> {
        self.lock().outcome.clone()
    }

    /// Register a callback for the completion transition.
    ///
    /// If the promise is already complete the callback runs immediately on
    /// the calling thread; otherwise it runs exactly once on whichever thread
    /// performs the completing [`Promise::try_complete`].
    pub fn subscribe(self: &Arc<Self>, subscriber: UpdateSubscriber) {
        let run_now = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                true
            } else {
                state.subscribers.push(subscriber);
                return;
            }
        };
        debug_assert!(run_now);
        subscriber(self);
    }

    /// Set the outcome, if not already set.
    ///
    /// Returns `true` when this call performed the transition. Subscribers
    /// are drained under the lock but invoked after it is released, so they
    /// may freely call back into the promise.
    pub fn try_complete(self: &Arc<Self>, outcome: PromiseOutcome) -> bool {
        let subscribers = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.subscribers)
        };
        self.done.notify_waiters();
        for subscriber in subscribers {
            subscriber(self);
        }
        true
    }

    /// Wait until the promise is complete.
    ///
    /// Returns immediately if it already is. `Notify` is edge-triggered, so
    /// the waiter is registered before the completion flag is re-checked.
    pub async fn completed(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PromiseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("is_complete", &self.is_complete())
            .finish()
    }
}
