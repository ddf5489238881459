use crate::types::{ExecutableTask, RunnableTask, StartedTask, TaskExecutionResult};
use anyhow::{Context, Result};

/// Encodes the four stored record kinds to and from opaque byte blobs.
///
/// Any stable encoding works; the engine only requires that what one process
/// wrote, any peer can read back. Failures are fatal to the containing
/// operation and propagate.
pub trait RecordCodec: Send + Sync {
    fn encode_runnable(&self, record: &RunnableTask) -> Result<Vec<u8>>;
    fn decode_runnable(&self, bytes: &[u8]) -> Result<RunnableTask>;

    fn encode_executable(&self, record: &ExecutableTask) -> Result<Vec<u8>>;
    fn decode_executable(&self, bytes: &[u8]) -> Result<ExecutableTask>;

    fn encode_started(&self, record: &StartedTask) -> Result<Vec<u8>>;
    fn decode_started(&self, bytes: &[u8]) -> Result<StartedTask>;

    fn encode_result(&self, record: &TaskExecutionResult) -> Result<Vec<u8>>;
    fn decode_result(&self, bytes: &[u8]) -> Result<TaskExecutionResult>;
}

/// JSON record codec, the default.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn encode_runnable(&self, record: &RunnableTask) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("encoding run record")
    }

    fn decode_runnable(&self, bytes: &[u8]) -> Result<RunnableTask> {
        serde_json::from_slice(bytes).context("decoding run record")
    }

    fn encode_executable(&self, record: &ExecutableTask) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("encoding executable task")
    }

    fn decode_executable(&self, bytes: &[u8]) -> Result<ExecutableTask> {
        serde_json::from_slice(bytes).context("decoding executable task")
    }

    fn encode_started(&self, record: &StartedTask) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("encoding started record")
    }

    fn decode_started(&self, bytes: &[u8]) -> Result<StartedTask> {
        serde_json::from_slice(bytes).context("decoding started record")
    }

    fn encode_result(&self, record: &TaskExecutionResult) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("encoding execution result")
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<TaskExecutionResult> {
        serde_json::from_slice(bytes).context("decoding execution result")
    }
}
