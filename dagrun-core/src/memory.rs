use crate::coordinator::{parent_path, Coordinator, CoordinatorError, CreateMode, Version};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

struct NodeRecord {
    data: Vec<u8>,
    version: Version,
    /// Owning session for ephemeral nodes.
    ephemeral_owner: Option<u64>,
}

struct ClusterState {
    nodes: BTreeMap<String, NodeRecord>,
    /// Sequential-create counters, one per parent node.
    seq_counters: HashMap<String, u64>,
    next_session: u64,
    dead_sessions: HashSet<u64>,
}

/// In-memory coordination service shared by every simulated process.
///
/// Each `connect()` hands out a session-scoped handle; killing a session
/// removes its ephemeral nodes and fires change events, which is what makes
/// crash and failover tests honest.
pub struct MemoryCluster {
    state: RwLock<ClusterState>,
    events: broadcast::Sender<String>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            state: RwLock::new(ClusterState {
                nodes: BTreeMap::new(),
                seq_counters: HashMap::new(),
                next_session: 1,
                dead_sessions: HashSet::new(),
            }),
            events,
        })
    }

    /// Open a new session against the cluster.
    pub async fn connect(self: &Arc<Self>) -> Arc<MemoryCoordinator> {
        let mut state = self.state.write().await;
        let session = state.next_session;
        state.next_session += 1;
        Arc::new(MemoryCoordinator {
            cluster: self.clone(),
            session,
        })
    }

    /// Simulate a process crash: the session's ephemeral nodes vanish and
    /// every later operation through its handle fails with `ConnectionLoss`.
    pub async fn kill_session(&self, session: u64) {
        let mut state = self.state.write().await;
        state.dead_sessions.insert(session);
        let doomed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in doomed {
            state.nodes.remove(&path);
            let _ = self.events.send(parent_path(&path).to_string());
        }
    }

    fn notify(&self, path: &str) {
        let _ = self.events.send(path.to_string());
    }
}

/// One session's handle onto a [`MemoryCluster`].
pub struct MemoryCoordinator {
    cluster: Arc<MemoryCluster>,
    session: u64,
}

impl MemoryCoordinator {
    fn check_alive(&self, state: &ClusterState) -> Result<(), CoordinatorError> {
        if state.dead_sessions.contains(&self.session) {
            return Err(CoordinatorError::ConnectionLoss);
        }
        Ok(())
    }
}

fn child_names(nodes: &BTreeMap<String, NodeRecord>, parent: &str) -> Vec<String> {
    let prefix = if parent == "/" {
        "/".to_string()
    } else {
        format!("{parent}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(path, _)| path.starts_with(&prefix))
        .filter_map(|(path, _)| {
            let name = &path[prefix.len()..];
            (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
        })
        .collect()
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinatorError> {
        let mut state = self.cluster.state.write().await;
        self.check_alive(&state)?;

        // Parents as needed, persistent and empty.
        let parent = parent_path(path);
        if parent != "/" {
            let mut ancestor = String::new();
            for segment in parent.split('/').filter(|s| !s.is_empty()) {
                ancestor.push('/');
                ancestor.push_str(segment);
                if !state.nodes.contains_key(&ancestor) {
                    state.nodes.insert(
                        ancestor.clone(),
                        NodeRecord {
                            data: Vec::new(),
                            version: 0,
                            ephemeral_owner: None,
                        },
                    );
                    self.cluster.notify(parent_path(&ancestor));
                }
            }
        }

        let final_path = if mode.is_sequential() {
            let counter = state
                .seq_counters
                .entry(parent.to_string())
                .or_insert(0);
            *counter += 1;
            format!("{path}{:010}", *counter)
        } else {
            if state.nodes.contains_key(path) {
                return Err(CoordinatorError::NodeExists(path.to_string()));
            }
            path.to_string()
        };

        state.nodes.insert(
            final_path.clone(),
            NodeRecord {
                data,
                version: 0,
                ephemeral_owner: mode.is_ephemeral().then_some(self.session),
            },
        );
        self.cluster.notify(parent_path(&final_path));
        Ok(final_path)
    }

    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, Version)>, CoordinatorError> {
        let state = self.cluster.state.read().await;
        self.check_alive(&state)?;
        Ok(state
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.version)))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Version,
    ) -> Result<Version, CoordinatorError> {
        let mut state = self.cluster.state.write().await;
        self.check_alive(&state)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        if node.version != expected {
            return Err(CoordinatorError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.version += 1;
        node.data = data;
        let version = node.version;
        self.cluster.notify(path);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<(), CoordinatorError> {
        let mut state = self.cluster.state.write().await;
        self.check_alive(&state)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(CoordinatorError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        state.nodes.remove(path);
        self.cluster.notify(parent_path(path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinatorError> {
        let state = self.cluster.state.read().await;
        self.check_alive(&state)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinatorError> {
        let state = self.cluster.state.read().await;
        self.check_alive(&state)?;
        Ok(child_names(&state.nodes, path))
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.cluster.events.subscribe()
    }

    fn session_id(&self) -> u64 {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_round_trip_with_parents() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;

        c.create("/a/b/c", b"hello".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (data, version) = c.get_data("/a/b/c").await.unwrap().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, 0);
        assert!(c.exists("/a/b").await.unwrap());
        assert_eq!(c.children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;

        c.create("/n", vec![], CreateMode::Persistent).await.unwrap();
        let err = c.create("/n", vec![], CreateMode::Persistent).await;
        assert!(matches!(err, Err(CoordinatorError::NodeExists(_))));
    }

    #[tokio::test]
    async fn sequential_names_are_monotonic_per_parent() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;

        let a = c
            .create("/q/entry-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = c
            .create("/q/entry-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/q/entry-0000000001");
        assert_eq!(b, "/q/entry-0000000002");
        assert!(a < b);
    }

    #[tokio::test]
    async fn conditional_set_and_delete() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;

        c.create("/v", b"one".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let v1 = c.set_data("/v", b"two".to_vec(), 0).await.unwrap();
        assert_eq!(v1, 1);

        let stale = c.set_data("/v", b"three".to_vec(), 0).await;
        assert!(matches!(stale, Err(CoordinatorError::BadVersion { .. })));

        let stale = c.delete("/v", Some(0)).await;
        assert!(matches!(stale, Err(CoordinatorError::BadVersion { .. })));
        c.delete("/v", Some(1)).await.unwrap();
        assert!(matches!(
            c.delete("/v", None).await,
            Err(CoordinatorError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn children_are_sorted() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;

        for name in ["/dir/b", "/dir/a", "/dir/c"] {
            c.create(name, vec![], CreateMode::Persistent).await.unwrap();
        }
        assert_eq!(c.children("/dir").await.unwrap(), vec!["a", "b", "c"]);
        assert!(c.children("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn killed_session_loses_ephemerals_and_connection() {
        let cluster = MemoryCluster::new();
        let c1 = cluster.connect().await;
        let c2 = cluster.connect().await;

        c1.create("/locks/item", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        c1.create("/data", vec![], CreateMode::Persistent).await.unwrap();

        let mut events = c2.subscribe();
        cluster.kill_session(c1.session_id()).await;

        assert!(!c2.exists("/locks/item").await.unwrap());
        assert!(c2.exists("/data").await.unwrap());
        assert!(matches!(
            c1.exists("/data").await,
            Err(CoordinatorError::ConnectionLoss)
        ));

        // Watchers saw the lock's parent change.
        let mut saw = false;
        while let Ok(path) = events.try_recv() {
            saw |= path == "/locks";
        }
        assert!(saw);
    }

    #[tokio::test]
    async fn change_events_cover_create_set_delete() {
        let cluster = MemoryCluster::new();
        let c = cluster.connect().await;
        let mut events = c.subscribe();

        c.create("/w/x", b"1".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        c.set_data("/w/x", b"2".to_vec(), 0).await.unwrap();
        c.delete("/w/x", None).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(path) = events.try_recv() {
            seen.push(path);
        }
        assert!(seen.contains(&"/w".to_string()));
        assert!(seen.contains(&"/w/x".to_string()));
    }
}
