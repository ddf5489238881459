//! Worker-side execution path: from a dequeued task to a recorded result.

use crate::codec::RecordCodec;
use crate::coordinator::{Coordinator, CoordinatorError, CreateMode};
use crate::paths;
use crate::queue::QueueItemHandler;
use crate::types::{
    ExecutableTask, ManagerState, StartedTask, TaskExecutionResult, SPECIAL_META_KEY,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// User task business logic. Implementations must be idempotent: a task can
/// be invoked more than once across the cluster, with at most one recorded
/// completion. Return a failed [`TaskExecutionResult`] for business failures;
/// reserve `Err` for infrastructure problems that merit redelivery.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ExecutableTask) -> Result<TaskExecutionResult>;
}

/// Bridges one task type's queue to its user executor.
pub(crate) struct TaskRunner {
    coordinator: Arc<dyn Coordinator>,
    codec: Arc<dyn RecordCodec>,
    executor: Arc<dyn TaskExecutor>,
    instance_name: String,
    state: watch::Receiver<ManagerState>,
}

impl TaskRunner {
    pub(crate) fn new(
        coordinator: Arc<dyn Coordinator>,
        codec: Arc<dyn RecordCodec>,
        executor: Arc<dyn TaskExecutor>,
        instance_name: String,
        state: watch::Receiver<ManagerState>,
    ) -> Self {
        Self {
            coordinator,
            codec,
            executor,
            instance_name,
            state,
        }
    }
}

#[async_trait]
impl QueueItemHandler for TaskRunner {
    async fn handle(&self, task: ExecutableTask) -> Result<()> {
        if *self.state.borrow() != ManagerState::Started {
            // Dropped, not executed: the entry outlives our lock and is
            // re-dispensed elsewhere.
            bail!("manager is not started; dropping task {}", task.task_id);
        }

        let completed_path = paths::completed_task(&task.run_id, &task.task_id);
        if self.coordinator.exists(&completed_path).await? {
            debug!(run_id = %task.run_id, task_id = %task.task_id,
                "completion record already present; skipping execution");
            return Ok(());
        }

        let started = StartedTask {
            instance_name: self.instance_name.clone(),
            start_date_utc: Utc::now(),
        };
        let started_path = paths::started_task(&task.run_id, &task.task_id);
        match self
            .coordinator
            .create(&started_path, self.codec.encode_started(&started)?, CreateMode::Persistent)
            .await
        {
            // Best effort: a restarted worker re-running the task is fine.
            Ok(_) | Err(CoordinatorError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut user_task = task.clone();
        user_task.metadata.remove(SPECIAL_META_KEY);

        // Run on a separate tokio task so a panicking executor is contained
        // and reported as a failed invocation instead of killing the consumer.
        let executor = self.executor.clone();
        let result = tokio::spawn(async move { executor.execute(&user_task).await }).await;
        let result = match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(run_id = %task.run_id, task_id = %task.task_id,
                    error = %format!("{e:#}"), "task executor failed; no completion recorded");
                return Err(e);
            }
            Err(join_error) => {
                warn!(run_id = %task.run_id, task_id = %task.task_id,
                    "task executor panicked; no completion recorded");
                return Err(anyhow!("task executor panicked: {join_error}"));
            }
        };

        match self
            .coordinator
            .create(&completed_path, self.codec.encode_result(&result)?, CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                info!(run_id = %task.run_id, task_id = %task.task_id,
                    success = result.is_success(), "task completed");
                Ok(())
            }
            // A peer recorded completion first; ours is discarded.
            Err(CoordinatorError::NodeExists(_)) => {
                info!(run_id = %task.run_id, task_id = %task.task_id,
                    "completion already recorded by a peer");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
