//! Coordinator namespace layout. The concrete path strings are a
//! compatibility surface; changing them strands in-flight state.

use crate::types::{RunId, TaskId, TaskType};

pub const RUNS: &str = "/runs";
pub const STARTED_TASKS: &str = "/started-tasks";
pub const COMPLETED_TASKS: &str = "/completed-tasks";
pub const QUEUED_TASKS: &str = "/queued-tasks";
pub const SCHEDULER_LEADER: &str = "/scheduler-leader";

pub fn run(run_id: &RunId) -> String {
    format!("{RUNS}/{run_id}")
}

/// Key shared by the started/completed/queued record families.
pub fn run_task_key(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{run_id}-{task_id}")
}

/// Prefix matching every record of a run under the per-task record dirs.
/// RunIds render at a fixed width, so a prefix scan is unambiguous.
pub fn run_prefix(run_id: &RunId) -> String {
    format!("{run_id}-")
}

pub fn started_task(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{STARTED_TASKS}/{}", run_task_key(run_id, task_id))
}

pub fn completed_task(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{COMPLETED_TASKS}/{}", run_task_key(run_id, task_id))
}

pub fn queued_task(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{QUEUED_TASKS}/{}", run_task_key(run_id, task_id))
}

pub fn queue(task_type: &TaskType) -> String {
    format!("/queue-{}-{}", task_type.name, task_type.version)
}

pub fn queue_locks(task_type: &TaskType) -> String {
    format!("/queue-locks-{}-{}", task_type.name, task_type.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueMode;

    #[test]
    fn layout_is_stable() {
        let run_id = RunId::parse("018f4e2e-1111-7000-8000-000000000001").unwrap();
        let task_id = TaskId::new("step-a");
        assert_eq!(
            run(&run_id),
            "/runs/018f4e2e-1111-7000-8000-000000000001"
        );
        assert_eq!(
            completed_task(&run_id, &task_id),
            "/completed-tasks/018f4e2e-1111-7000-8000-000000000001-step-a"
        );
        assert!(started_task(&run_id, &task_id).starts_with(STARTED_TASKS));
        assert!(run_task_key(&run_id, &task_id).starts_with(&run_prefix(&run_id)));

        let task_type = TaskType::new("build", "1", true, QueueMode::Standard);
        assert_eq!(queue(&task_type), "/queue-build-1");
        assert_eq!(queue_locks(&task_type), "/queue-locks-build-1");
    }
}
