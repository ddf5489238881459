use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reserved metadata key carrying the priority-or-delay integer for a task.
///
/// For `QueueMode::Delay` the value is an epoch-millis delivery time; for
/// `QueueMode::Priority` it is a 32-bit priority key (smallest first). The
/// queue layer consumes it and the worker strips it before the user executor
/// sees the metadata.
pub const SPECIAL_META_KEY: &str = "__nirmata_special_meta__";

/// User metadata attached to a task. Flat string map, opaque to the engine.
pub type Metadata = BTreeMap<String, String>;

// ─── Identifiers ──────────────────────────────────────────────

/// Unique identifier for one run of a submitted DAG. Time-sortable (UUIDv7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a task, unique within a run.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Task types and queue modes ───────────────────────────────

/// How a task type's queue dispenses items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueMode {
    /// FIFO by enqueue order.
    Standard,
    /// Smallest 32-bit priority key first; ties broken by enqueue order.
    Priority,
    /// FIFO with a future-dated delivery time per item.
    Delay,
}

/// Descriptor for a category of executable work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskType {
    pub name: String,
    pub version: String,
    /// Idempotency is required for crash recovery: a task may be invoked more
    /// than once, with at most one recorded completion.
    pub is_idempotent: bool,
    pub mode: QueueMode,
}

impl TaskType {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        is_idempotent: bool,
        mode: QueueMode,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            is_idempotent,
            mode,
        }
    }

    /// Idempotent standard-mode task type.
    pub fn standard(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(name, version, true, QueueMode::Standard)
    }
}

// ─── User-facing DAG node ─────────────────────────────────────

/// A node in the user-supplied task DAG.
///
/// Children are prerequisites: every child completes before the parent is
/// eligible to run. A child shared between two parents (via `Arc`) expresses
/// a fan-in joint such as the bottom of a diamond.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    /// `None` marks a structural (non-executable) grouping node.
    pub task_type: Option<TaskType>,
    pub metadata: Metadata,
    pub children: Vec<Arc<Task>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type: Some(task_type),
            metadata: Metadata::new(),
            children: Vec::new(),
        }
    }

    /// A non-executable grouping node. Never enqueued; treated as complete
    /// once all of its children are complete.
    pub fn structural(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            task_type: None,
            metadata: Metadata::new(),
            children: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Arc<Task>) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<Arc<Task>>) -> Self {
        self.children.extend(children);
        self
    }
}

// ─── Stored records ───────────────────────────────────────────

/// Flattened form of one task as stored in the run record and on queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutableTask {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// `None` is stored as the null-type sentinel (name="", version="",
    /// executable=false) so the wire format stays stable.
    #[serde(with = "task_type_wire")]
    pub task_type: Option<TaskType>,
    pub metadata: Metadata,
}

impl ExecutableTask {
    pub fn is_executable(&self) -> bool {
        self.task_type.is_some()
    }
}

/// The durable run record: the flattened DAG plus lifecycle timestamps.
///
/// Mutated only through version-checked conditional updates; the
/// `completion_time_utc` field, once set, is never cleared.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnableTask {
    pub tasks: BTreeMap<TaskId, ExecutableTask>,
    /// Adjacency: task id → prerequisite task ids (its children in the
    /// submitted tree). Every id listed here is a key of `tasks`.
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    pub start_time_utc: DateTime<Utc>,
    pub completion_time_utc: Option<DateTime<Utc>>,
    pub parent_run_id: Option<RunId>,
}

impl RunnableTask {
    /// Prerequisites of `task_id`, empty if none are recorded.
    pub fn prerequisites(&self, task_id: &TaskId) -> &[TaskId] {
        self.dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Written by a worker when it begins executing a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartedTask {
    pub instance_name: String,
    pub start_date_utc: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Success,
    Failed,
}

/// Terminal outcome of one task execution. Its creation under the
/// completed-tasks path is the atomic completion signal for the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub status: TaskExecutionStatus,
    pub message: String,
    pub result_data: Metadata,
    pub completion_time_utc: DateTime<Utc>,
}

impl TaskExecutionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TaskExecutionStatus::Success,
            message: message.into(),
            result_data: Metadata::new(),
            completion_time_utc: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskExecutionStatus::Failed,
            message: message.into(),
            result_data: Metadata::new(),
            completion_time_utc: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.result_data.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskExecutionStatus::Success
    }
}

// ─── Introspection views ──────────────────────────────────────

/// Summary of one run for listing and cleaner decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub start_time_utc: DateTime<Utc>,
    pub completion_time_utc: Option<DateTime<Utc>>,
    pub parent_run_id: Option<RunId>,
}

impl RunInfo {
    pub fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Started,
    Completed,
}

/// Execution progress of one executable task within a run.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub instance_name: Option<String>,
    pub start_date_utc: Option<DateTime<Utc>>,
    pub result: Option<TaskExecutionResult>,
}

impl TaskInfo {
    /// A task counts as completed only when both a started and a completed
    /// record exist; a lone started record means in progress.
    pub fn status(&self) -> TaskStatus {
        match (&self.instance_name, &self.result) {
            (Some(_), Some(_)) => TaskStatus::Completed,
            (Some(_), None) => TaskStatus::Started,
            _ => TaskStatus::NotStarted,
        }
    }
}

/// Static description of one task within a run (structural nodes included).
#[derive(Clone, Debug)]
pub struct TaskDetails {
    pub task_id: TaskId,
    pub task_type: Option<TaskType>,
    pub metadata: Metadata,
}

// ─── Manager lifecycle ────────────────────────────────────────

/// One-way lifecycle of the workflow manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Latent,
    Started,
    Closed,
}

// ─── Null-type wire sentinel ──────────────────────────────────

/// Wire encoding for `Option<TaskType>`: structural nodes are stored as
/// (name="", version="", executable=false) for path-schema compatibility.
mod task_type_wire {
    use super::{QueueMode, TaskType};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct TaskTypeWire {
        name: String,
        version: String,
        is_idempotent: bool,
        mode: QueueMode,
        executable: bool,
    }

    pub fn serialize<S: Serializer>(
        value: &Option<TaskType>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wire = match value {
            Some(t) => TaskTypeWire {
                name: t.name.clone(),
                version: t.version.clone(),
                is_idempotent: t.is_idempotent,
                mode: t.mode,
                executable: true,
            },
            None => TaskTypeWire {
                name: String::new(),
                version: String::new(),
                is_idempotent: false,
                mode: QueueMode::Standard,
                executable: false,
            },
        };
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<TaskType>, D::Error> {
        let wire = TaskTypeWire::deserialize(deserializer)?;
        if !wire.executable {
            return Ok(None);
        }
        Ok(Some(TaskType {
            name: wire.name,
            version: wire.version,
            is_idempotent: wire.is_idempotent,
            mode: wire.mode,
        }))
    }
}
