//! Leader-elected control loop that advances runs.
//!
//! Every process runs a standby loop; only the current leader scans runs,
//! enqueues ready tasks and marks runs complete. The queued marker written
//! before each enqueue makes the (marker, enqueue) pair restart-safe: a new
//! leader re-enqueues every marked-but-uncompleted task, and the worker-side
//! short-circuit makes the duplicate harmless.

use crate::cleaner::{self, CleanerPolicy};
use crate::codec::RecordCodec;
use crate::coordinator::{await_change, Coordinator, CoordinatorError, CreateMode};
use crate::leader::LeaderElection;
use crate::paths;
use crate::queue::DistributedQueue;
use crate::types::{RunId, RunnableTask, TaskId};
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Test-observability callbacks, injected at construction.
#[derive(Clone, Default)]
pub struct SchedulerHooks {
    pub on_scan: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_task_enqueued: Option<Arc<dyn Fn(&RunId, &TaskId) + Send + Sync>>,
    pub on_run_completed: Option<Arc<dyn Fn(&RunId) + Send + Sync>>,
}

pub(crate) struct CleanerConfig {
    pub(crate) policy: Arc<dyn CleanerPolicy>,
    pub(crate) sweep_interval: Duration,
}

pub(crate) struct Scheduler {
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) codec: Arc<dyn RecordCodec>,
    pub(crate) instance_name: String,
    pub(crate) poll_interval: Duration,
    pub(crate) cleaner: Option<CleanerConfig>,
    pub(crate) hooks: SchedulerHooks,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// Standby loop: block on leadership, lead until shutdown or connection
    /// loss, re-enter the election.
    pub(crate) async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let election = LeaderElection::new(
            self.coordinator.clone(),
            paths::SCHEDULER_LEADER,
            self.instance_name.clone(),
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let acquired = tokio::select! {
                _ = shutdown.changed() => false,
                outcome = election.acquire() => match outcome {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "leader election failed; backing off");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        false
                    }
                },
            };
            if !acquired {
                continue;
            }
            info!(instance = %self.instance_name, "scheduler leadership acquired");
            self.lead(&mut shutdown).await;
            election.release().await;
            info!(instance = %self.instance_name, "scheduler leadership released");
        }
        election.release().await;
    }

    async fn lead(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut events = self.coordinator.subscribe();
        // First pass of a tenure re-enqueues marked-but-uncompleted tasks.
        let mut recovery = true;
        let mut last_sweep = Instant::now();
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.scan(recovery).await {
                Ok(()) => recovery = false,
                Err(e) if is_connection_loss(&e) => {
                    warn!("coordinator connection lost; standing down from leadership");
                    return;
                }
                Err(e) => warn!(error = %format!("{e:#}"), "scheduler pass failed"),
            }

            if let Some(config) = &self.cleaner {
                if last_sweep.elapsed() >= config.sweep_interval {
                    match cleaner::sweep(&self.coordinator, &self.codec, &config.policy).await {
                        Ok(()) => {}
                        Err(e) if is_connection_loss(&e) => return,
                        Err(e) => warn!(error = %format!("{e:#}"), "cleaner sweep failed"),
                    }
                    last_sweep = Instant::now();
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = await_change(&mut events, &[paths::RUNS, paths::COMPLETED_TASKS]) => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One pass over every run.
    async fn scan(&self, recovery: bool) -> Result<()> {
        if let Some(hook) = &self.hooks.on_scan {
            hook();
        }
        let run_names = self.coordinator.children(paths::RUNS).await?;
        if run_names.is_empty() {
            return Ok(());
        }
        let completed_keys: HashSet<String> = self
            .coordinator
            .children(paths::COMPLETED_TASKS)
            .await?
            .into_iter()
            .collect();
        let queued_keys: HashSet<String> = self
            .coordinator
            .children(paths::QUEUED_TASKS)
            .await?
            .into_iter()
            .collect();

        for name in run_names {
            let Ok(run_id) = RunId::parse(&name) else {
                warn!(node = %name, "skipping unparseable run node");
                continue;
            };
            // The run can vanish mid-pass if a clean races us.
            let Some((bytes, _)) = self.coordinator.get_data(&paths::run(&run_id)).await? else {
                continue;
            };
            let runnable = match self.codec.decode_runnable(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    warn!(run_id = %run_id, error = %format!("{e:#}"), "skipping undecodable run record");
                    continue;
                }
            };
            if runnable.completion_time_utc.is_some() {
                continue;
            }
            self.advance_run(&run_id, &runnable, &completed_keys, &queued_keys, recovery)
                .await?;
        }
        Ok(())
    }

    async fn advance_run(
        &self,
        run_id: &RunId,
        runnable: &RunnableTask,
        completed_keys: &HashSet<String>,
        queued_keys: &HashSet<String>,
        recovery: bool,
    ) -> Result<()> {
        let complete = completion_map(run_id, runnable, completed_keys);
        let mut all_executable_complete = true;

        for task_id in topological_order(runnable) {
            let task = &runnable.tasks[&task_id];
            if !task.is_executable() {
                continue;
            }
            if complete[&task_id] {
                continue;
            }
            all_executable_complete = false;

            let ready = runnable
                .prerequisites(&task_id)
                .iter()
                .all(|p| complete.get(p).copied().unwrap_or(false));
            if !ready {
                continue;
            }

            let marked = queued_keys.contains(&paths::run_task_key(run_id, &task_id));
            if marked && !recovery {
                continue;
            }
            if !marked {
                // Marker first, enqueue second; a crash between the two is
                // repaired by the next tenure's recovery pass.
                match self
                    .coordinator
                    .create(
                        &paths::queued_task(run_id, &task_id),
                        Vec::new(),
                        CreateMode::Persistent,
                    )
                    .await
                {
                    Ok(_) | Err(CoordinatorError::NodeExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let Some(task_type) = task.task_type.clone() else {
                continue;
            };
            let queue =
                DistributedQueue::new(self.coordinator.clone(), self.codec.clone(), task_type);
            queue.put(task).await?;
            info!(run_id = %run_id, task_id = %task_id, recovered = marked, "task enqueued");
            if let Some(hook) = &self.hooks.on_task_enqueued {
                hook(run_id, &task_id);
            }
        }

        if all_executable_complete && complete_run(&self.coordinator, &self.codec, run_id).await? {
            if let Some(hook) = &self.hooks.on_run_completed {
                hook(run_id);
            }
        }
        Ok(())
    }
}

/// Mark a run complete via a version-checked update. `BadVersion` re-reads
/// and retries the decision; used verbatim by cancellation, which is a
/// forced completion. Returns whether the run exists.
pub(crate) async fn complete_run(
    coordinator: &Arc<dyn Coordinator>,
    codec: &Arc<dyn RecordCodec>,
    run_id: &RunId,
) -> Result<bool> {
    loop {
        let Some((bytes, version)) = coordinator.get_data(&paths::run(run_id)).await? else {
            return Ok(false);
        };
        let mut runnable = codec.decode_runnable(&bytes)?;
        if runnable.completion_time_utc.is_some() {
            return Ok(true);
        }
        runnable.completion_time_utc = Some(Utc::now());
        match coordinator
            .set_data(&paths::run(run_id), codec.encode_runnable(&runnable)?, version)
            .await
        {
            Ok(_) => {
                info!(run_id = %run_id, "run marked complete");
                return Ok(true);
            }
            Err(CoordinatorError::BadVersion { .. }) => continue,
            Err(CoordinatorError::NoNode(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Completion per task. Executable tasks are complete when their result
/// record exists; structural tasks are transparent pass-throughs, complete
/// when all of their prerequisites are.
pub(crate) fn completion_map(
    run_id: &RunId,
    runnable: &RunnableTask,
    completed_keys: &HashSet<String>,
) -> BTreeMap<TaskId, bool> {
    fn resolve(
        task_id: &TaskId,
        run_id: &RunId,
        runnable: &RunnableTask,
        completed_keys: &HashSet<String>,
        memo: &mut BTreeMap<TaskId, bool>,
    ) -> bool {
        if let Some(known) = memo.get(task_id) {
            return *known;
        }
        let Some(task) = runnable.tasks.get(task_id) else {
            return false;
        };
        let value = if task.is_executable() {
            completed_keys.contains(&paths::run_task_key(run_id, task_id))
        } else {
            runnable
                .prerequisites(task_id)
                .iter()
                .all(|p| resolve(p, run_id, runnable, completed_keys, memo))
        };
        memo.insert(task_id.clone(), value);
        value
    }

    let mut memo = BTreeMap::new();
    for task_id in runnable.tasks.keys() {
        resolve(task_id, run_id, runnable, completed_keys, &mut memo);
    }
    memo
}

/// Deterministic traversal: topological over the prerequisite graph, ties
/// broken by TaskId ascending, so enqueue order is stable for a given DAG.
pub(crate) fn topological_order(runnable: &RunnableTask) -> Vec<TaskId> {
    let mut indegree: BTreeMap<&TaskId, usize> = runnable
        .tasks
        .keys()
        .map(|id| (id, runnable.prerequisites(id).len()))
        .collect();
    let mut dependents: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();
    for (id, prereqs) in &runnable.dependencies {
        for prereq in prereqs {
            dependents.entry(prereq).or_default().push(id);
        }
    }

    let mut frontier: BTreeSet<&TaskId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(runnable.tasks.len());

    while let Some(next) = frontier.iter().next().copied() {
        frontier.remove(next);
        order.push(next.clone());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    frontier.insert(dependent);
                }
            }
        }
    }
    order
}

pub(crate) fn is_connection_loss(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<CoordinatorError>(),
        Some(CoordinatorError::ConnectionLoss)
    )
}
