//! Removal of completed runs and their per-task records.

use crate::codec::RecordCodec;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::paths;
use crate::types::{RunId, RunInfo};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides which completed runs the scheduler leader may delete.
pub trait CleanerPolicy: Send + Sync {
    fn should_clean(&self, info: &RunInfo) -> bool;
}

/// Standard policy: clean once a run has been complete for `min_age`.
pub struct MinAgeCleaner {
    min_age: Duration,
}

impl MinAgeCleaner {
    pub fn new(min_age: Duration) -> Self {
        Self { min_age }
    }
}

impl CleanerPolicy for MinAgeCleaner {
    fn should_clean(&self, info: &RunInfo) -> bool {
        let Some(completed_at) = info.completion_time_utc else {
            return false;
        };
        let age = Utc::now().signed_duration_since(completed_at);
        age.to_std().map(|age| age >= self.min_age).unwrap_or(false)
    }
}

/// Delete every record of a run: started/completed/queued-marker children,
/// then the run node itself. Missing children are ignored; returns whether
/// the run existed.
pub(crate) async fn clean_run(
    coordinator: &Arc<dyn Coordinator>,
    run_id: &RunId,
) -> Result<bool> {
    let run_path = paths::run(run_id);
    if !coordinator.exists(&run_path).await? {
        return Ok(false);
    }

    let prefix = paths::run_prefix(run_id);
    for dir in [
        paths::STARTED_TASKS,
        paths::COMPLETED_TASKS,
        paths::QUEUED_TASKS,
    ] {
        for child in coordinator.children(dir).await? {
            if !child.starts_with(&prefix) {
                continue;
            }
            match coordinator.delete(&format!("{dir}/{child}"), None).await {
                Ok(()) | Err(CoordinatorError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    match coordinator.delete(&run_path, None).await {
        Ok(()) => {
            debug!(run_id = %run_id, "run cleaned");
            Ok(true)
        }
        Err(CoordinatorError::NoNode(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// One cleaner pass over all runs, applying `policy`.
pub(crate) async fn sweep(
    coordinator: &Arc<dyn Coordinator>,
    codec: &Arc<dyn RecordCodec>,
    policy: &Arc<dyn CleanerPolicy>,
) -> Result<()> {
    for name in coordinator.children(paths::RUNS).await? {
        let Ok(run_id) = RunId::parse(&name) else {
            warn!(node = %name, "skipping unparseable run node");
            continue;
        };
        let Some((bytes, _)) = coordinator.get_data(&paths::run(&run_id)).await? else {
            continue;
        };
        let runnable = match codec.decode_runnable(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(run_id = %run_id, error = %format!("{e:#}"), "skipping undecodable run record");
                continue;
            }
        };
        let info = RunInfo {
            run_id,
            start_time_utc: runnable.start_time_utc,
            completion_time_utc: runnable.completion_time_utc,
            parent_run_id: runnable.parent_run_id,
        };
        if policy.should_clean(&info) {
            clean_run(coordinator, &run_id).await?;
        }
    }
    Ok(())
}
