//! Distributed DAG workflow engine over a strongly-consistent coordination
//! service.
//!
//! A client submits a task DAG and receives a run id; worker processes across
//! the cluster pick up tasks whose prerequisites are satisfied, execute them
//! through user-supplied [`TaskExecutor`]s, and persist results. A
//! leader-elected scheduler advances runs; per-task-type durable queues carry
//! work with FIFO, priority or delayed-delivery semantics. The engine
//! guarantees at most one *recorded* completion per task — tasks themselves
//! may be invoked more than once and must be idempotent.
//!
//! All durable state lives in the coordinator behind the [`Coordinator`]
//! trait; [`MemoryCluster`] provides an in-process implementation with real
//! session semantics for tests and single-node use.
//!
//! ```no_run
//! use dagrun_core::{
//!     MemoryCluster, Task, TaskType, TaskTypeRegistration, WorkflowManagerBuilder,
//! };
//! # use std::sync::Arc;
//! # async fn example(executor: Arc<dyn dagrun_core::TaskExecutor>) -> anyhow::Result<()> {
//! let cluster = MemoryCluster::new();
//! let manager = WorkflowManagerBuilder::new("worker-1", cluster.connect().await)
//!     .add_task_type(TaskTypeRegistration::new(
//!         TaskType::standard("etl", "1"),
//!         executor,
//!     ))
//!     .build();
//! manager.start().await?;
//!
//! let extract = Arc::new(Task::new("extract", TaskType::standard("etl", "1")));
//! let load = Task::new("load", TaskType::standard("etl", "1")).with_child(extract);
//! let run_id = manager.submit_task(&load).await?;
//! # let _ = run_id;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod codec;
pub mod coordinator;
pub mod dag;
pub mod executor;
pub mod leader;
pub mod manager;
pub mod memory;
pub mod paths;
pub mod queue;
pub mod scheduler;
pub mod types;

pub use cleaner::{CleanerPolicy, MinAgeCleaner};
pub use codec::{JsonCodec, RecordCodec};
pub use coordinator::{Coordinator, CoordinatorError, CreateMode, Version};
pub use dag::build_runnable_task;
pub use executor::TaskExecutor;
pub use leader::LeaderElection;
pub use manager::{TaskTypeRegistration, WorkflowManager, WorkflowManagerBuilder};
pub use memory::{MemoryCluster, MemoryCoordinator};
pub use queue::{DistributedQueue, QueueConsumer, QueueItemHandler};
pub use scheduler::SchedulerHooks;
pub use types::{
    ExecutableTask, ManagerState, Metadata, QueueMode, RunId, RunInfo, RunnableTask, StartedTask,
    Task, TaskDetails, TaskExecutionResult, TaskExecutionStatus, TaskId, TaskInfo, TaskStatus,
    TaskType, SPECIAL_META_KEY,
};
