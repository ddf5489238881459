//! Durable per-task-type queues over the coordinator.
//!
//! An entry is a child node whose name embeds the priority-or-delay key and a
//! monotonic sequence, so plain name order is dispense order for every mode.
//! Consumers fence each entry with a per-item ephemeral lock; a consumer that
//! dies mid-callback loses its lock and the entry is re-dispensed.

use crate::codec::RecordCodec;
use crate::coordinator::{await_change, Coordinator, CoordinatorError, CreateMode};
use crate::paths;
use crate::types::{ExecutableTask, QueueMode, TaskType, SPECIAL_META_KEY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives dequeued items. An `Err` leaves the entry in place for another
/// attempt; `Ok` removes it. Worker executors resolve user outcomes to a
/// recorded result, so an `Err` here means an infrastructure failure.
#[async_trait]
pub trait QueueItemHandler: Send + Sync {
    async fn handle(&self, task: ExecutableTask) -> Result<()>;
}

/// Handle to one task type's queue.
#[derive(Clone)]
pub struct DistributedQueue {
    coordinator: Arc<dyn Coordinator>,
    codec: Arc<dyn RecordCodec>,
    task_type: TaskType,
    queue_path: String,
    lock_path: String,
}

impl DistributedQueue {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        codec: Arc<dyn RecordCodec>,
        task_type: TaskType,
    ) -> Self {
        let queue_path = paths::queue(&task_type);
        let lock_path = paths::queue_locks(&task_type);
        Self {
            coordinator,
            codec,
            task_type,
            queue_path,
            lock_path,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Enqueue a task. The priority-or-delay key is read from the reserved
    /// metadata entry; its absence means priority 0 / immediately due.
    pub async fn put(&self, task: &ExecutableTask) -> Result<()> {
        let key = embedded_key(self.task_type.mode, task)?;
        let prefix = format!("{}/entry-{key:016x}-", self.queue_path);
        let bytes = self.codec.encode_executable(task)?;
        let created = self
            .coordinator
            .create(&prefix, bytes, CreateMode::PersistentSequential)
            .await?;
        debug!(task_id = %task.task_id, entry = %created, "queued entry");
        Ok(())
    }

    /// One dispense pass: walk entries in name order, lock, hand to the
    /// handler. Returns whether any entry was consumed.
    async fn scan_once(&self, handler: &Arc<dyn QueueItemHandler>) -> Result<bool> {
        let names = self.coordinator.children(&self.queue_path).await?;
        let now = Utc::now().timestamp_millis();
        let mut consumed = false;

        for name in names {
            if self.task_type.mode == QueueMode::Delay {
                // Entries sort by due time; the first future-dated one ends
                // the dispensable region.
                match embedded_millis(&name) {
                    Some(due) if due > now => break,
                    _ => {}
                }
            }

            let lock = format!("{}/{name}", self.lock_path);
            match self
                .coordinator
                .create(&lock, Vec::new(), CreateMode::Ephemeral)
                .await
            {
                Ok(_) => {}
                Err(CoordinatorError::NodeExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            let entry = format!("{}/{name}", self.queue_path);
            let outcome = self.dispense(&entry, handler).await;
            if let Err(e) = self.coordinator.delete(&lock, None).await {
                if !matches!(e, CoordinatorError::NoNode(_)) {
                    warn!(lock = %lock, error = %e, "failed to release queue lock");
                }
            }
            consumed |= outcome?;
        }
        Ok(consumed)
    }

    /// Read the locked entry and run the callback. The entry is removed only
    /// after the callback returns `Ok`.
    async fn dispense(&self, entry: &str, handler: &Arc<dyn QueueItemHandler>) -> Result<bool> {
        // The entry can be gone if a peer consumed it before our lock landed.
        let Some((bytes, _)) = self.coordinator.get_data(entry).await? else {
            return Ok(false);
        };
        let task = self.codec.decode_executable(&bytes)?;

        match handler.handle(task).await {
            Ok(()) => match self.coordinator.delete(entry, None).await {
                Ok(()) | Err(CoordinatorError::NoNode(_)) => Ok(true),
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                warn!(entry = %entry, error = %format!("{e:#}"), "dequeue callback failed; entry retained for retry");
                Ok(false)
            }
        }
    }
}

/// A background consumer bound to one queue.
pub struct QueueConsumer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueConsumer {
    pub fn start(
        queue: DistributedQueue,
        handler: Arc<dyn QueueItemHandler>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consume_loop(queue, handler, poll_interval, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stop the consumer. A callback stuck past the grace period is aborted;
    /// its entry stays locked until this process's session ends.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(Duration::from_secs(1), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }
}

async fn consume_loop(
    queue: DistributedQueue,
    handler: Arc<dyn QueueItemHandler>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = queue.coordinator.subscribe();
    loop {
        if *shutdown.borrow() {
            return;
        }
        match queue.scan_once(&handler).await {
            // Drain without waiting while entries keep coming.
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(queue = %queue.queue_path, error = %format!("{e:#}"), "queue pass failed");
            }
        }
        let watch_paths = [queue.queue_path.as_str()];
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = await_change(&mut events, &watch_paths) => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn embedded_key(mode: QueueMode, task: &ExecutableTask) -> Result<u64> {
    let raw = task.metadata.get(SPECIAL_META_KEY);
    match mode {
        QueueMode::Standard => Ok(0),
        QueueMode::Priority | QueueMode::Delay => match raw {
            None => Ok(0),
            Some(value) => {
                let parsed: i64 = value
                    .parse()
                    .with_context(|| format!("bad special meta for {}: {value:?}", task.task_id))?;
                Ok(parsed.max(0) as u64)
            }
        },
    }
}

/// Priority-or-delay key embedded in an entry name.
fn embedded_millis(name: &str) -> Option<i64> {
    let hex = name.strip_prefix("entry-")?.get(..16)?;
    u64::from_str_radix(hex, 16).ok().map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::memory::MemoryCluster;
    use crate::types::{Metadata, RunId, TaskId};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    struct Recording {
        log: Mutex<Vec<(String, Instant)>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
            })
        }

        fn ids(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl QueueItemHandler for Recording {
        async fn handle(&self, task: ExecutableTask) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push((task.task_id.to_string(), Instant::now()));
            Ok(())
        }
    }

    fn task(run_id: RunId, id: &str, task_type: &TaskType, meta: Option<i64>) -> ExecutableTask {
        let mut metadata = Metadata::new();
        if let Some(m) = meta {
            metadata.insert(SPECIAL_META_KEY.to_string(), m.to_string());
        }
        ExecutableTask {
            run_id,
            task_id: TaskId::new(id),
            task_type: Some(task_type.clone()),
            metadata,
        }
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if condition().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn standard_mode_is_fifo() {
        let cluster = MemoryCluster::new();
        let coordinator = cluster.connect().await;
        let task_type = TaskType::standard("fifo", "1");
        let queue = DistributedQueue::new(coordinator, Arc::new(JsonCodec), task_type.clone());

        let run_id = RunId::new();
        for id in ["t1", "t2", "t3"] {
            queue.put(&task(run_id, id, &task_type, None)).await.unwrap();
        }

        let recording = Recording::new();
        let consumer = QueueConsumer::start(
            queue.clone(),
            recording.clone(),
            Duration::from_millis(25),
        );

        eventually(|| async { recording.ids().len() == 3 }).await;
        assert_eq!(recording.ids(), vec!["t1", "t2", "t3"]);
        assert!(queue
            .coordinator
            .children(&queue.queue_path)
            .await
            .unwrap()
            .is_empty());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn priority_mode_dispenses_smallest_key_first() {
        let cluster = MemoryCluster::new();
        let coordinator = cluster.connect().await;
        let task_type = TaskType::new("prio", "1", true, QueueMode::Priority);
        let queue = DistributedQueue::new(coordinator, Arc::new(JsonCodec), task_type.clone());

        let run_id = RunId::new();
        for (id, priority) in [("1", 1), ("2", 10), ("3", 5), ("4", 30), ("5", 20)] {
            queue
                .put(&task(run_id, id, &task_type, Some(priority)))
                .await
                .unwrap();
        }

        let recording = Recording::new();
        let consumer = QueueConsumer::start(
            queue.clone(),
            recording.clone(),
            Duration::from_millis(25),
        );

        eventually(|| async { recording.ids().len() == 5 }).await;
        assert_eq!(recording.ids(), vec!["1", "3", "2", "5", "4"]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn equal_priorities_fall_back_to_enqueue_order() {
        let cluster = MemoryCluster::new();
        let coordinator = cluster.connect().await;
        let task_type = TaskType::new("prio-tie", "1", true, QueueMode::Priority);
        let queue = DistributedQueue::new(coordinator, Arc::new(JsonCodec), task_type.clone());

        let run_id = RunId::new();
        for id in ["first", "second", "third"] {
            queue.put(&task(run_id, id, &task_type, Some(7))).await.unwrap();
        }

        let recording = Recording::new();
        let consumer = QueueConsumer::start(
            queue.clone(),
            recording.clone(),
            Duration::from_millis(25),
        );

        eventually(|| async { recording.ids().len() == 3 }).await;
        assert_eq!(recording.ids(), vec!["first", "second", "third"]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn delay_mode_withholds_future_dated_entries() {
        let cluster = MemoryCluster::new();
        let coordinator = cluster.connect().await;
        let task_type = TaskType::new("delayed", "1", true, QueueMode::Delay);
        let queue = DistributedQueue::new(coordinator, Arc::new(JsonCodec), task_type.clone());

        let run_id = RunId::new();
        let enqueued_at = Instant::now();
        let due = Utc::now().timestamp_millis() + 400;
        queue
            .put(&task(run_id, "later", &task_type, Some(due)))
            .await
            .unwrap();
        queue.put(&task(run_id, "now", &task_type, None)).await.unwrap();

        let recording = Recording::new();
        let consumer = QueueConsumer::start(
            queue.clone(),
            recording.clone(),
            Duration::from_millis(25),
        );

        eventually(|| async { recording.ids().len() == 2 }).await;
        let log = recording.log.lock().unwrap().clone();
        assert_eq!(log[0].0, "now");
        assert_eq!(log[1].0, "later");
        assert!(log[0].1.duration_since(enqueued_at) < Duration::from_millis(300));
        assert!(log[1].1.duration_since(enqueued_at) >= Duration::from_millis(400));
        consumer.stop().await;
    }

    struct FlakyOnce {
        inner: Arc<Recording>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl QueueItemHandler for FlakyOnce {
        async fn handle(&self, task: ExecutableTask) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("transient failure");
            }
            self.inner.handle(task).await
        }
    }

    #[tokio::test]
    async fn failed_callback_retains_the_entry_for_retry() {
        let cluster = MemoryCluster::new();
        let coordinator = cluster.connect().await;
        let task_type = TaskType::standard("retry", "1");
        let queue = DistributedQueue::new(coordinator, Arc::new(JsonCodec), task_type.clone());

        queue
            .put(&task(RunId::new(), "only", &task_type, None))
            .await
            .unwrap();

        let recording = Recording::new();
        let handler = Arc::new(FlakyOnce {
            inner: recording.clone(),
            failures_left: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
        });
        let consumer = QueueConsumer::start(queue.clone(), handler.clone(), Duration::from_millis(25));

        eventually(|| async { recording.ids() == vec!["only"] }).await;
        assert!(handler.attempts.load(Ordering::SeqCst) >= 3);
        assert!(queue
            .coordinator
            .children(&queue.queue_path)
            .await
            .unwrap()
            .is_empty());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn each_entry_goes_to_exactly_one_consumer() {
        let cluster = MemoryCluster::new();
        let task_type = TaskType::standard("shared", "1");
        let codec: Arc<dyn RecordCodec> = Arc::new(JsonCodec);

        let producer = cluster.connect().await;
        let queue = DistributedQueue::new(producer, codec.clone(), task_type.clone());
        let run_id = RunId::new();
        for i in 0..12 {
            queue
                .put(&task(run_id, &format!("item-{i:02}"), &task_type, None))
                .await
                .unwrap();
        }

        let recording = Recording::new();
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let session = cluster.connect().await;
            let q = DistributedQueue::new(session, codec.clone(), task_type.clone());
            consumers.push(QueueConsumer::start(
                q,
                recording.clone(),
                Duration::from_millis(25),
            ));
        }

        eventually(|| async { recording.ids().len() == 12 }).await;
        let mut ids = recording.ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 12, "an entry was dispensed more than once");
        for consumer in consumers {
            consumer.stop().await;
        }
    }

    struct Stuck;

    #[async_trait]
    impl QueueItemHandler for Stuck {
        async fn handle(&self, _task: ExecutableTask) -> Result<()> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn entry_is_redelivered_after_lock_holder_dies() {
        let cluster = MemoryCluster::new();
        let task_type = TaskType::standard("crashy", "1");
        let codec: Arc<dyn RecordCodec> = Arc::new(JsonCodec);

        let session1 = cluster.connect().await;
        let session1_id = session1.session_id();
        let queue1 = DistributedQueue::new(session1, codec.clone(), task_type.clone());
        queue1
            .put(&task(RunId::new(), "sticky", &task_type, None))
            .await
            .unwrap();

        let lock_path = queue1.lock_path.clone();
        let stuck_consumer =
            QueueConsumer::start(queue1.clone(), Arc::new(Stuck), Duration::from_millis(25));

        // Wait for the first consumer to take the item's lock, then crash it.
        let observer = cluster.connect().await;
        let lock_dir = lock_path.clone();
        let obs = observer.clone();
        eventually(|| {
            let obs = obs.clone();
            let lock_dir = lock_dir.clone();
            async move { !obs.children(&lock_dir).await.unwrap().is_empty() }
        })
        .await;
        cluster.kill_session(session1_id).await;

        let session2 = cluster.connect().await;
        let queue2 = DistributedQueue::new(session2, codec, task_type.clone());
        let recording = Recording::new();
        let consumer2 =
            QueueConsumer::start(queue2, recording.clone(), Duration::from_millis(25));

        eventually(|| async { recording.ids() == vec!["sticky"] }).await;
        consumer2.stop().await;
        stuck_consumer.stop().await;
    }
}
