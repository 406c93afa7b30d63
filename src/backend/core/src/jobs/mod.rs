//! Job queue, handler registry and worker dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  enqueue   ┌─────────────┐  claim_next  ┌────────────────┐
//! │ Scheduler │──────────▶│  JobQueue   │─────────────▶│ JobDispatcher  │
//! │ / submit  │            │ (priority,  │◀─────────────│ (N workers)    │
//! └───────────┘            │  retries)   │ complete/fail└───────┬────────┘
//!                          └─────────────┘                      │ handle
//!                                                       ┌───────▼────────┐
//!                                                       │HandlerRegistry │
//!                                                       └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use amoeba_core::jobs::{FnHandler, HandlerRegistry, JobDispatcher, JobQueue, DispatcherConfig};
//!
//! let registry = HandlerRegistry::builder()
//!     .register(FnHandler::new("email", |ctx| async move { send(ctx.payload()).await }))
//!     .build()?;
//!
//! let queue = JobQueue::in_memory();
//! queue.enqueue("email", 10, serde_json::json!({"to": "a@example.com"})).await?;
//!
//! let handle = JobDispatcher::new(queue.clone(), Arc::new(registry), DispatcherConfig::default()).start();
//! handle.stop().await;
//! ```

pub mod job;
pub mod queue;
pub mod registry;
pub mod worker;

pub use job::{
    BackoffStrategy, FailOutcome, Job, JobContext, JobError, JobId, JobPriority, JobResult,
    JobStatus, NewJob, RetryPolicy,
};
pub use queue::{
    InMemoryQueueBackend, InsertOutcome, JobFilter, JobQueue, ProcessingStats, QueueBackend,
    QueueConfig, QueueMetrics,
};
pub use registry::{FnHandler, HandlerRegistry, HandlerRegistryBuilder, JobHandler};
pub use worker::{
    DispatchOutcome, DispatcherConfig, DispatcherHandle, JobDispatcher, WorkerStats,
    WorkerStatsSnapshot,
};
