//! Flattens a user task tree into the stored run representation.

use crate::types::{ExecutableTask, RunId, RunnableTask, Task, TaskId};
use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::BTreeMap;

/// Flatten `root` into a [`RunnableTask`] for `run_id`.
///
/// Children are prerequisites. A node shared between parents (same `Arc`)
/// is visited once; two distinct tasks claiming the same id are rejected.
pub fn build_runnable_task(
    run_id: &RunId,
    root: &Task,
    parent_run_id: Option<RunId>,
) -> Result<RunnableTask> {
    let mut tasks: BTreeMap<TaskId, ExecutableTask> = BTreeMap::new();
    let mut dependencies: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
    let mut seen: BTreeMap<TaskId, *const Task> = BTreeMap::new();

    visit(run_id, root, &mut tasks, &mut dependencies, &mut seen)?;

    Ok(RunnableTask {
        tasks,
        dependencies,
        start_time_utc: Utc::now(),
        completion_time_utc: None,
        parent_run_id,
    })
}

fn visit(
    run_id: &RunId,
    task: &Task,
    tasks: &mut BTreeMap<TaskId, ExecutableTask>,
    dependencies: &mut BTreeMap<TaskId, Vec<TaskId>>,
    seen: &mut BTreeMap<TaskId, *const Task>,
) -> Result<()> {
    if task.id.as_str().is_empty() {
        bail!("task id must not be empty");
    }
    if task.id.as_str().contains('/') {
        bail!("task id {:?} must not contain '/'", task.id.as_str());
    }

    // Node identity distinguishes a fan-in (the same node reached through
    // two parents) from a genuine id collision.
    let identity = task as *const Task;
    match seen.get(&task.id) {
        // Re-reaching the same node through another parent is a fan-in.
        Some(prior) if *prior == identity => return Ok(()),
        Some(_) => bail!("duplicate task id in submission: {}", task.id),
        None => {}
    }
    seen.insert(task.id.clone(), identity);

    tasks.insert(
        task.id.clone(),
        ExecutableTask {
            run_id: *run_id,
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            metadata: task.metadata.clone(),
        },
    );
    dependencies.insert(
        task.id.clone(),
        task.children.iter().map(|c| c.id.clone()).collect(),
    );

    for child in &task.children {
        visit(run_id, child, tasks, dependencies, seen)?;
    }
    Ok(())
}
