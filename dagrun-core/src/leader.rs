//! Leader election: first-in-line among ephemeral-sequential candidates.

use crate::coordinator::{await_change, Coordinator, CoordinatorError, CreateMode};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
    election_path: String,
    /// Stored as candidate node data so operators can see who is enrolled.
    instance_name: String,
    /// Name of our candidate node while enrolled.
    candidate: Mutex<Option<String>>,
}

impl LeaderElection {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        election_path: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            election_path: election_path.into(),
            instance_name: instance_name.into(),
            candidate: Mutex::new(None),
        }
    }

    /// Enroll (once) and block until our candidate is first in line. Safe to
    /// cancel: the candidate stays enrolled and a later call resumes waiting.
    pub async fn acquire(&self) -> Result<()> {
        let me = self.enroll().await?;
        let mut events = self.coordinator.subscribe();
        loop {
            let candidates = self.coordinator.children(&self.election_path).await?;
            match candidates.first() {
                Some(first) if *first == me => {
                    debug!(candidate = %me, "leadership acquired");
                    return Ok(());
                }
                _ => {}
            }
            await_change(&mut events, &[self.election_path.as_str()]).await;
        }
    }

    async fn enroll(&self) -> Result<String> {
        let mut candidate = self.candidate.lock().await;
        if let Some(name) = candidate.as_ref() {
            return Ok(name.clone());
        }
        let created = self
            .coordinator
            .create(
                &format!("{}/candidate-", self.election_path),
                self.instance_name.clone().into_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let name = created
            .rsplit('/')
            .next()
            .unwrap_or(&created)
            .to_string();
        debug!(candidate = %name, "enrolled for leadership");
        *candidate = Some(name.clone());
        Ok(name)
    }

    /// Withdraw from the election, releasing leadership if held.
    pub async fn release(&self) {
        let mut candidate = self.candidate.lock().await;
        if let Some(name) = candidate.take() {
            let path = format!("{}/{name}", self.election_path);
            match self.coordinator.delete(&path, None).await {
                Ok(()) | Err(CoordinatorError::NoNode(_)) => {}
                Err(e) => debug!(candidate = %name, error = %e, "failed to withdraw candidate"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use std::time::Duration;

    const PATH: &str = "/test-leader";

    #[tokio::test]
    async fn first_candidate_wins_immediately() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;
        let election = LeaderElection::new(c, PATH, "one");
        tokio::time::timeout(Duration::from_secs(1), election.acquire())
            .await
            .expect("acquire timed out")
            .unwrap();
        election.release().await;
    }

    #[tokio::test]
    async fn release_hands_leadership_to_the_next_in_line() {
        let cluster = MemoryCluster::new();
        let c1 = cluster.connect().await;
        let c2 = cluster.connect().await;

        let first = Arc::new(LeaderElection::new(c1, PATH, "one"));
        first.acquire().await.unwrap();

        let second = Arc::new(LeaderElection::new(c2, PATH, "two"));
        let waiting = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire().await })
        };
        // The follower parks while the leader is enrolled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        first.release().await;
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("follower never acquired")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn leader_crash_hands_leadership_over() {
        let cluster = MemoryCluster::new();
        let c1 = cluster.connect().await;
        let session1 = c1.session_id();
        let c2 = cluster.connect().await;

        let first = LeaderElection::new(c1, PATH, "one");
        first.acquire().await.unwrap();

        let second = Arc::new(LeaderElection::new(c2, PATH, "two"));
        let waiting = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        cluster.kill_session(session1).await;
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("follower never acquired")
            .unwrap()
            .unwrap();
    }
}
