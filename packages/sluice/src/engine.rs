//! Engine: wires the store, scheduler, jobs manager, expiry wheel,
//! dispatcher, and worker pool into one runnable unit.
//!
//! ```text
//! clients ──► JobsManager ──► PriorityScheduler ──► JobDispatcher
//!                 │                                      │
//!                 ▼                                      ▼
//!            PromiseStore ◄── completions ◄──────── WorkerPool
//!                 │
//!                 ▼
//!             BlobStore
//! ```
//!
//! Transports stay outside: an embedding application resolves promises and
//! submits work through [`Engine::manager`].

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blob::SchemaRegistry;
use crate::cancellation::CancellationPool;
use crate::client_queues::ExpiryQueue;
use crate::config::ServerOptions;
use crate::dispatch::{JobDispatcher, JobExecutor, Service, WorkerPool};
use crate::error::SluiceError;
use crate::manager::JobsManager;
use crate::priority::PriorityScheduler;
use crate::promise::SchemaCode;
use crate::storage::open_blob_store;
use crate::store::PromiseStore;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    options: ServerOptions,
    schemas: SchemaRegistry,
    executor: Option<Arc<dyn JobExecutor>>,
}

impl EngineBuilder {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            schemas: SchemaRegistry::new(),
            executor: None,
        }
    }

    /// Register an application payload schema for blob rehydration.
    pub fn with_schema(self, code: SchemaCode, name: &'static str) -> Self {
        self.schemas.register(code, name);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate the options and assemble the engine. Nothing is spawned
    /// until [`Engine::start`].
    pub fn build(self) -> Result<Engine, SluiceError> {
        self.options.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| SluiceError::user_input("an executor is required"))?;

        let blobs = open_blob_store(&self.options)?;
        let schemas = Arc::new(self.schemas);
        let store = PromiseStore::new(self.options.service_id, blobs, schemas);
        let expiry = ExpiryQueue::new(
            self.options.expiry_ticks,
            self.options.expiry_bucket_count,
        );
        let scheduler = PriorityScheduler::new(self.options.count_priorities, expiry.clone())?;
        let manager = JobsManager::new(store, scheduler.clone(), Arc::new(CancellationPool::new()));

        Ok(Engine {
            options: self.options,
            scheduler,
            manager,
            expiry,
            executor,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled job server core.
pub struct Engine {
    options: ServerOptions,
    scheduler: Arc<PriorityScheduler>,
    manager: Arc<JobsManager>,
    expiry: Arc<ExpiryQueue>,
    executor: Arc<dyn JobExecutor>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// The submission and cancellation surface.
    pub fn manager(&self) -> &Arc<JobsManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<PromiseStore> {
        self.manager.store()
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Spawn the expiry pump, the dispatcher, and the worker pool. Must be
    /// called inside a tokio runtime.
    pub fn start(&self) {
        let (sender, receiver) = mpsc::channel(self.options.dispatch_capacity);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(self.expiry.spawn_pump(self.shutdown.clone()));
        tasks.push(spawn_service(
            JobDispatcher::new(self.scheduler.clone(), sender),
            self.shutdown.clone(),
        ));
        tasks.push(spawn_service(
            WorkerPool::new(
                self.executor.clone(),
                receiver,
                self.options.worker_count,
            ),
            self.shutdown.clone(),
        ));
        info!(
            priorities = self.options.count_priorities,
            workers = self.options.worker_count,
            "engine started"
        );
    }

    /// Stop every service and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        futures::future::join_all(tasks).await;
        info!("engine stopped");
    }
}

fn spawn_service<S: Service + 'static>(service: S, shutdown: CancellationToken) -> JoinHandle<()> {
    let name = service.name();
    tokio::spawn(async move {
        if let Err(e) = Box::new(service).run(shutdown).await {
            tracing::error!(service = name, error = %e, "service failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobExecutor;
    use crate::error::JobError;
    use crate::manager::WorkDescriptor;
    use crate::promise::PromisePayload;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        async fn execute(
            &self,
            _work: &WorkDescriptor,
            _cancel: &CancellationToken,
        ) -> Result<PromisePayload, JobError> {
            Ok(PromisePayload::new(SchemaCode(1), &b"ok"[..]))
        }
    }

    #[test]
    fn build_requires_an_executor() {
        let result = EngineBuilder::new(ServerOptions::default()).build();
        assert!(matches!(result, Err(SluiceError::UserInput(_))));
    }

    #[test]
    fn build_rejects_invalid_options() {
        let options = ServerOptions::builder().count_priorities(0).build();
        let result = EngineBuilder::new(options)
            .with_executor(Arc::new(NoopExecutor))
            .build();
        assert!(matches!(result, Err(SluiceError::UserInput(_))));
    }

    #[tokio::test]
    async fn engine_starts_and_shuts_down() {
        let engine = EngineBuilder::new(ServerOptions::default())
            .with_schema(SchemaCode(1), "test-payload")
            .with_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();
        engine.start();
        engine.shutdown().await;
    }
}
