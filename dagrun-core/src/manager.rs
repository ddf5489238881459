//! Facade wiring the scheduler, queues and workers behind one lifecycle.

use crate::cleaner::{self, CleanerPolicy};
use crate::codec::{JsonCodec, RecordCodec};
use crate::coordinator::{Coordinator, CreateMode};
use crate::dag;
use crate::executor::{TaskExecutor, TaskRunner};
use crate::paths;
use crate::queue::{DistributedQueue, QueueConsumer};
use crate::scheduler::{complete_run, CleanerConfig, Scheduler, SchedulerHooks};
use crate::types::{
    ManagerState, RunId, RunInfo, Task, TaskDetails, TaskExecutionResult, TaskId, TaskInfo,
    TaskType, SPECIAL_META_KEY,
};
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// One task type's worker configuration.
pub struct TaskTypeRegistration {
    pub task_type: TaskType,
    pub executor: Arc<dyn TaskExecutor>,
    pub consumer_count: usize,
}

impl TaskTypeRegistration {
    pub fn new(task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            task_type,
            executor,
            consumer_count: 1,
        }
    }

    pub fn with_consumers(mut self, consumer_count: usize) -> Self {
        self.consumer_count = consumer_count;
        self
    }
}

pub struct WorkflowManagerBuilder {
    instance_name: String,
    coordinator: Arc<dyn Coordinator>,
    codec: Arc<dyn RecordCodec>,
    registrations: Vec<TaskTypeRegistration>,
    cleaner: Option<(Arc<dyn CleanerPolicy>, Duration)>,
    poll_interval: Duration,
    hooks: SchedulerHooks,
}

impl WorkflowManagerBuilder {
    pub fn new(instance_name: impl Into<String>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            instance_name: instance_name.into(),
            coordinator,
            codec: Arc::new(JsonCodec),
            registrations: Vec::new(),
            cleaner: None,
            poll_interval: Duration::from_millis(500),
            hooks: SchedulerHooks::default(),
        }
    }

    pub fn add_task_type(mut self, registration: TaskTypeRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Enable the periodic cleaner on whichever process holds scheduler
    /// leadership.
    pub fn with_auto_cleaner(
        mut self,
        policy: Arc<dyn CleanerPolicy>,
        sweep_interval: Duration,
    ) -> Self {
        self.cleaner = Some((policy, sweep_interval));
        self
    }

    /// Bounded wake-up interval for the scheduler loop and queue consumers;
    /// coordinator watches usually fire first.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_hooks(mut self, hooks: SchedulerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> WorkflowManager {
        let (state, _) = watch::channel(ManagerState::Latent);
        let (shutdown, _) = watch::channel(false);
        WorkflowManager {
            instance_name: self.instance_name,
            coordinator: self.coordinator,
            codec: self.codec,
            registrations: self.registrations,
            cleaner: self.cleaner,
            poll_interval: self.poll_interval,
            hooks: self.hooks,
            state,
            shutdown,
            consumers: Mutex::new(Vec::new()),
            scheduler: Mutex::new(None),
        }
    }
}

/// One process's handle on the workflow cluster.
///
/// Lifecycle is one-way: Latent → Started → Closed. `start()` enters the
/// scheduler election and launches the consumer pools; `close()` shuts both
/// down idempotently.
pub struct WorkflowManager {
    instance_name: String,
    coordinator: Arc<dyn Coordinator>,
    codec: Arc<dyn RecordCodec>,
    registrations: Vec<TaskTypeRegistration>,
    cleaner: Option<(Arc<dyn CleanerPolicy>, Duration)>,
    poll_interval: Duration,
    hooks: SchedulerHooks,
    state: watch::Sender<ManagerState>,
    shutdown: watch::Sender<bool>,
    consumers: Mutex<Vec<QueueConsumer>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowManager {
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    fn ensure_started(&self) -> Result<()> {
        if self.state() != ManagerState::Started {
            bail!("workflow manager is not started");
        }
        Ok(())
    }

    /// Must be called exactly once, from the latent state.
    pub async fn start(&self) -> Result<()> {
        let mut transitioned = false;
        self.state.send_modify(|state| {
            if *state == ManagerState::Latent {
                *state = ManagerState::Started;
                transitioned = true;
            }
        });
        if !transitioned {
            bail!("start() may only be called once, from the latent state");
        }

        let scheduler = Scheduler {
            coordinator: self.coordinator.clone(),
            codec: self.codec.clone(),
            instance_name: self.instance_name.clone(),
            poll_interval: self.poll_interval,
            cleaner: self
                .cleaner
                .as_ref()
                .map(|(policy, sweep_interval)| CleanerConfig {
                    policy: policy.clone(),
                    sweep_interval: *sweep_interval,
                }),
            hooks: self.hooks.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        *self.scheduler.lock().await = Some(tokio::spawn(scheduler.run()));

        let mut consumers = self.consumers.lock().await;
        for registration in &self.registrations {
            let queue = DistributedQueue::new(
                self.coordinator.clone(),
                self.codec.clone(),
                registration.task_type.clone(),
            );
            for _ in 0..registration.consumer_count.max(1) {
                let runner = Arc::new(TaskRunner::new(
                    self.coordinator.clone(),
                    self.codec.clone(),
                    registration.executor.clone(),
                    self.instance_name.clone(),
                    self.state.subscribe(),
                ));
                consumers.push(QueueConsumer::start(
                    queue.clone(),
                    runner,
                    self.poll_interval,
                ));
            }
        }
        info!(instance = %self.instance_name, "workflow manager started");
        Ok(())
    }

    /// Idempotent shutdown: stops consumers and releases scheduler
    /// leadership. In-flight queue locks die with this process's session.
    pub async fn close(&self) {
        let mut transitioned = false;
        self.state.send_modify(|state| {
            if *state != ManagerState::Closed {
                *state = ManagerState::Closed;
                transitioned = true;
            }
        });
        if !transitioned {
            return;
        }
        let _ = self.shutdown.send(true);

        let stopping: Vec<QueueConsumer> = self.consumers.lock().await.drain(..).collect();
        for consumer in stopping {
            consumer.stop().await;
        }
        if let Some(handle) = self.scheduler.lock().await.take() {
            let mut handle = handle;
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        info!(instance = %self.instance_name, "workflow manager closed");
    }

    // ── Submission ──

    pub async fn submit_task(&self, task: &Task) -> Result<RunId> {
        self.submit(None, task).await
    }

    /// Submit a child workflow. The parent run's completion is independent
    /// of the child's.
    pub async fn submit_sub_task(&self, parent_run_id: RunId, task: &Task) -> Result<RunId> {
        self.submit(Some(parent_run_id), task).await
    }

    async fn submit(&self, parent_run_id: Option<RunId>, task: &Task) -> Result<RunId> {
        self.ensure_started()?;
        let run_id = RunId::new();
        let runnable = dag::build_runnable_task(&run_id, task, parent_run_id)?;
        let bytes = self.codec.encode_runnable(&runnable)?;
        self.coordinator
            .create(&paths::run(&run_id), bytes, CreateMode::Persistent)
            .await?;
        info!(run_id = %run_id, tasks = runnable.tasks.len(), "run submitted");
        Ok(run_id)
    }

    /// Force-complete a run. The scheduler stops advancing it; in-flight
    /// tasks run to completion and their late results are ignored. Returns
    /// false when the run does not exist.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<bool> {
        self.ensure_started()?;
        let cancelled = complete_run(&self.coordinator, &self.codec, run_id).await?;
        if cancelled {
            info!(run_id = %run_id, "run cancelled");
        }
        Ok(cancelled)
    }

    // ── Introspection ──

    pub async fn get_task_execution_result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<TaskExecutionResult>> {
        match self
            .coordinator
            .get_data(&paths::completed_task(run_id, task_id))
            .await?
        {
            Some((bytes, _)) => Ok(Some(self.codec.decode_result(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_run_info(&self, run_id: &RunId) -> Result<Option<RunInfo>> {
        let Some((bytes, _)) = self.coordinator.get_data(&paths::run(run_id)).await? else {
            return Ok(None);
        };
        let runnable = self.codec.decode_runnable(&bytes)?;
        Ok(Some(RunInfo {
            run_id: *run_id,
            start_time_utc: runnable.start_time_utc,
            completion_time_utc: runnable.completion_time_utc,
            parent_run_id: runnable.parent_run_id,
        }))
    }

    pub async fn list_run_info(&self) -> Result<Vec<RunInfo>> {
        let mut infos = Vec::new();
        for name in self.coordinator.children(paths::RUNS).await? {
            let Ok(run_id) = RunId::parse(&name) else {
                continue;
            };
            if let Some(info) = self.get_run_info(&run_id).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    /// Static task descriptions, structural nodes included. The reserved
    /// queue-layer metadata key is not part of the user-visible view.
    pub async fn get_task_details(
        &self,
        run_id: &RunId,
    ) -> Result<Option<BTreeMap<TaskId, TaskDetails>>> {
        let Some((bytes, _)) = self.coordinator.get_data(&paths::run(run_id)).await? else {
            return Ok(None);
        };
        let runnable = self.codec.decode_runnable(&bytes)?;
        let details = runnable
            .tasks
            .into_iter()
            .map(|(task_id, task)| {
                let mut metadata = task.metadata;
                metadata.remove(SPECIAL_META_KEY);
                (
                    task_id.clone(),
                    TaskDetails {
                        task_id,
                        task_type: task.task_type,
                        metadata,
                    },
                )
            })
            .collect();
        Ok(Some(details))
    }

    /// Execution progress of every executable task in a run.
    pub async fn get_task_info(&self, run_id: &RunId) -> Result<Option<Vec<TaskInfo>>> {
        let Some((bytes, _)) = self.coordinator.get_data(&paths::run(run_id)).await? else {
            return Ok(None);
        };
        let runnable = self.codec.decode_runnable(&bytes)?;
        let mut infos = Vec::new();
        for (task_id, task) in &runnable.tasks {
            if !task.is_executable() {
                continue;
            }
            let started = match self
                .coordinator
                .get_data(&paths::started_task(run_id, task_id))
                .await?
            {
                Some((bytes, _)) => Some(self.codec.decode_started(&bytes)?),
                None => None,
            };
            let result = self.get_task_execution_result(run_id, task_id).await?;
            infos.push(TaskInfo {
                task_id: task_id.clone(),
                instance_name: started.as_ref().map(|s| s.instance_name.clone()),
                start_date_utc: started.as_ref().map(|s| s.start_date_utc),
                result,
            });
        }
        Ok(Some(infos))
    }

    /// Remove a run and all of its records. Returns false when the run does
    /// not exist.
    pub async fn clean(&self, run_id: &RunId) -> Result<bool> {
        cleaner::clean_run(&self.coordinator, run_id).await
    }
}
