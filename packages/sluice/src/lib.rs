//! # Sluice
//!
//! A promise-deduplicating job server core: many clients submit compute
//! requests, identical requests collapse onto shared **promises**, work is
//! scheduled fairly across priority classes and per-client queues, and
//! completed promise payloads are shed to a disk-resident blob store.
//!
//! ## Architecture
//!
//! ```text
//! client ──► JobsManager ─────────────────────────────┐
//!               │  dedup to shared promise /          │
//!               │  shared macro job                   │
//!               ▼                                     │
//!        PriorityScheduler                            │
//!        (priority ► owner ► named queue,             │
//!         deficit-weighted round robin)               │
//!               │                                     │
//!               ▼ root channel                        │
//!         JobDispatcher ── macro message? ──► expand lazily, re-enqueue
//!               │                                     micro-jobs
//!               ▼
//!          WorkerPool ──► JobExecutor (external)
//!               │
//!               ▼ completion
//!         PromiseStore ──► BlobStore (sled / memory)
//!          strong while incomplete, weak once persisted
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Completion is terminal** — a promise's outcome is set exactly once
//!    and never reverts; subscribers observe the transition exactly once.
//! 2. **Never homeless** — a completed promise always has a live in-memory
//!    representation or a persisted blob, never neither.
//! 3. **One expansion** — a macro job's expansion sequence is single-pass
//!    and shared; each participant message may pull it at most once, and
//!    the produced indices form a contiguous prefix.
//! 4. **Last one out turns off the lights** — only the last participant to
//!    withdraw completes a macro job's result with cancellation; the
//!    participant count's `0 → -1` transition is terminal and refuses
//!    resurrection.
//! 5. **FIFO within a queue, weight-fair across siblings** — and no flow
//!    ever holds its own lock while calling into another flow.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sluice::{
//!     EngineBuilder, JobQueueKey, SchemaCode, ServerOptions, WorkDescriptor,
//! };
//!
//! let engine = EngineBuilder::new(ServerOptions::builder().path("/var/lib/app/promises").build())
//!     .with_schema(SchemaCode(1), "render-result")
//!     .with_executor(Arc::new(MyExecutor))
//!     .build()?;
//! engine.start();
//!
//! let promise = engine.manager().enqueue_job(
//!     &JobQueueKey { owner, priority: 1, name: "renders".into() },
//!     Box::new(|store| store.create(None, None)),
//!     WorkDescriptor::new("render:tile"),
//!     None,
//! )?;
//! promise.completed().await;
//! ```
//!
//! ## What This Is Not
//!
//! Sluice is **not** a transport, an auth layer, a worker implementation,
//! or a distributed consensus system. It is the in-process core a job
//! server is built around.

// Core modules
mod blob;
mod cancellation;
mod client_queues;
mod config;
mod dispatch;
mod engine;
mod error;
mod flow;
mod macro_job;
mod manager;
mod priority;
mod promise;
mod promise_list;
mod storage;
mod store;


// Re-export promise types
pub use promise::{
    Promise, PromiseId, PromiseOutcome, PromisePayload, SchemaCode, UpdateSubscriber,
    PROMISE_KEY_LEN,
};

// Re-export the store and persistence seam
pub use blob::{decode_outcome, encode_outcome, SchemaRegistry, MAX_BLOB_LEN};
pub use storage::{open_blob_store, BlobStore, MemoryBlobStore, SledBlobStore};
pub use store::{PromiseStore, StoreStats};

// Re-export scheduling types
pub use client_queues::{
    ClientJobQueue, ExpiryDisposition, ExpiryProbe, ExpiryQueue, JobQueueKey, KeyedFlows, OwnerId,
};
pub use flow::{
    AccountSnapshot, ActivationEvent, ActivationSink, FlowId, ScheduledItem, SchedulingAccount,
    SchedulingFlow, SchedulingGroup, DEFAULT_CHARGE, DEFAULT_WEIGHT,
};
pub use priority::{default_priority_weight, OwnerQueues, PriorityScheduler, QueueSnapshot};

// Re-export the jobs manager surface
pub use macro_job::{MacroJob, MacroJobMessage};
pub use manager::{
    ClientRequestOwner, ExpansionFactory, ExpansionItem, ExpansionIter, JobMessage, JobsManager,
    PromiseRetriever, WorkDescriptor,
};

// Re-export cancellation types
pub use cancellation::{CancellationPool, ClientToken, RentedCancellation};

// Re-export dispatch and engine types (primary entry point)
pub use dispatch::{JobDispatcher, JobExecutor, Service, WorkerPool};
pub use engine::{Engine, EngineBuilder};

// Re-export configuration and errors
pub use config::{ServerOptions, MAX_HASH_INDEX_SIZE, MIN_HASH_INDEX_SIZE};
pub use error::{JobError, JobErrorKind, SluiceError};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
