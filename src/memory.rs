use {
    crate::{
        path::parent_path,
        store::{
            ClientFactory, CoordinationClient, CreateMode, DeletionWatch, NodeStat, SessionState,
            SessionStateTracker, StoreError,
        },
    },
    std::{
        collections::{BTreeMap, HashMap, VecDeque},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::sync::{broadcast, oneshot},
    tracing::{info, trace},
};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

///
/// Store operation that can have a failure injected with [`MemoryStore::fail_next`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    GetChildren,
    Exists,
    Remove,
}

struct Node {
    version: i64,
    owner: Option<u64>,
    next_sequence: u64,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    sessions: HashMap<u64, Arc<SessionStateTracker>>,
    faults: HashMap<Operation, VecDeque<StoreError>>,
    next_session_id: u64,
    reachable: bool,
    session_timeout: Duration,
}

impl Tree {
    fn take_fault(&mut self, op: Operation) -> Option<StoreError> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn delete(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some(watchers) = self.watches.remove(path) {
            trace!("firing {} deletion watch(es) on {path}", watchers.len());
            for tx in watchers {
                let _ = tx.send(());
            }
        }
    }

    fn end_session(&mut self, session_id: u64, state: SessionState) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.delete(&path);
        }
        if let Some(tracker) = self.sessions.remove(&session_id) {
            tracker.set(state);
        }
    }
}

///
/// In-process coordination store.
///
/// Each [`MemoryClient`] handed out is its own session: ephemeral nodes it creates vanish when
/// the session is expired or closed. Cloning the store shares the same tree.
///
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_session_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_session_timeout(session_timeout: Duration) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                version: 0,
                owner: None,
                next_sequence: 0,
            },
        );
        Self {
            tree: Arc::new(Mutex::new(Tree {
                nodes,
                watches: HashMap::new(),
                sessions: HashMap::new(),
                faults: HashMap::new(),
                next_session_id: 1,
                reachable: true,
                session_timeout,
            })),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///
    /// Opens a new, not yet connected session.
    ///
    pub fn client(&self) -> Arc<MemoryClient> {
        let mut tree = self.tree();
        let session_id = tree.next_session_id;
        tree.next_session_id += 1;
        let state = Arc::new(SessionStateTracker::new(SessionState::Disconnected));
        tree.sessions.insert(session_id, Arc::clone(&state));
        Arc::new(MemoryClient {
            store: self.clone(),
            session_id,
            state,
            session_timeout: tree.session_timeout,
        })
    }

    ///
    /// While unreachable, `connect` leaves sessions in `Connecting`. Becoming reachable again
    /// completes every pending connection.
    ///
    pub fn set_reachable(&self, reachable: bool) {
        let mut tree = self.tree();
        tree.reachable = reachable;
        if reachable {
            for tracker in tree.sessions.values() {
                if tracker.get() == SessionState::Connecting {
                    tracker.set(SessionState::SyncConnected);
                }
            }
        }
    }

    ///
    /// Expires a session: its ephemeral nodes are deleted and its client reports `Expired`.
    ///
    pub fn expire_session(&self, session_id: u64) {
        info!("expiring session {session_id}");
        self.tree().end_session(session_id, SessionState::Expired);
    }

    pub fn set_session_state(&self, session_id: u64, state: SessionState) {
        if let Some(tracker) = self.tree().sessions.get(&session_id) {
            tracker.set(state);
        }
    }

    ///
    /// Makes the next call of `op`, from any session, fail with `error`. Calls queue up.
    ///
    pub fn fail_next(&self, op: Operation, error: StoreError) {
        self.tree().faults.entry(op).or_default().push_back(error);
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(path)
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        let mut children = self.tree().child_names(path);
        children.sort();
        children
    }

    ///
    /// Deletes a node behind every client's back, firing deletion watches.
    ///
    pub fn delete_node(&self, path: &str) {
        self.tree().delete(path);
    }
}

impl ClientFactory for MemoryStore {
    fn create_client(&self) -> Arc<dyn CoordinationClient> {
        self.client()
    }
}

pub struct MemoryClient {
    store: MemoryStore,
    session_id: u64,
    state: Arc<SessionStateTracker>,
    session_timeout: Duration,
}

impl MemoryClient {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn ensure_usable(&self) -> Result<(), StoreError> {
        match self.state.get() {
            state if state.is_connected() => Ok(()),
            SessionState::Expired => Err(StoreError::SessionExpired),
            _ => Err(StoreError::ConnectionLoss),
        }
    }

    fn create_now(&self, path: &str, mode: CreateMode) -> Result<String, StoreError> {
        let mut tree = self.store.tree();
        if let Some(e) = tree.take_fault(Operation::Create) {
            return Err(e);
        }
        self.ensure_usable()?;
        let parent = parent_path(path).ok_or(StoreError::NodeExists)?;
        let parent_node = tree.nodes.get_mut(parent).ok_or(StoreError::NoNode)?;
        let (created, owner) = match mode {
            CreateMode::Persistent => (path.to_string(), None),
            CreateMode::EphemeralSequential => {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                (format!("{path}{seq:010}"), Some(self.session_id))
            }
        };
        if tree.nodes.contains_key(&created) {
            return Err(StoreError::NodeExists);
        }
        tree.nodes.insert(
            created.clone(),
            Node {
                version: 0,
                owner,
                next_sequence: 0,
            },
        );
        Ok(created)
    }

    fn get_children_now(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let mut tree = self.store.tree();
        if let Some(e) = tree.take_fault(Operation::GetChildren) {
            return Err(e);
        }
        self.ensure_usable()?;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode);
        }
        Ok(tree.child_names(path))
    }

    fn exists_now(&self, path: &str, watch: bool) -> Result<Option<(NodeStat, Option<DeletionWatch>)>, StoreError> {
        let mut tree = self.store.tree();
        if let Some(e) = tree.take_fault(Operation::Exists) {
            return Err(e);
        }
        self.ensure_usable()?;
        let Some(node) = tree.nodes.get(path) else {
            return Ok(None);
        };
        let stat = NodeStat {
            version: node.version,
            ephemeral: node.owner.is_some(),
        };
        let deletion = if watch {
            let (tx, deletion) = DeletionWatch::channel();
            tree.watches.entry(path.to_string()).or_default().push(tx);
            Some(deletion)
        } else {
            None
        };
        Ok(Some((stat, deletion)))
    }

    fn remove_now(&self, path: &str) -> Result<(), StoreError> {
        let mut tree = self.store.tree();
        if let Some(e) = tree.take_fault(Operation::Remove) {
            return Err(e);
        }
        self.ensure_usable()?;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode);
        }
        if !tree.child_names(path).is_empty() {
            return Err(StoreError::NotEmpty);
        }
        tree.delete(path);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CoordinationClient for MemoryClient {
    fn connect(&self) {
        let tree = self.store.tree();
        if self.state.get() != SessionState::Disconnected {
            return;
        }
        self.state.set(SessionState::Connecting);
        if tree.reachable {
            self.state.set(SessionState::SyncConnected);
        }
    }

    fn close(&self) {
        self.store.tree().end_session(self.session_id, SessionState::Closed);
        self.state.set(SessionState::Closed);
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn create(&self, path: &str, _data: Vec<u8>, mode: CreateMode) -> Result<String, StoreError> {
        self.create_now(path, mode)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.get_children_now(path)
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, StoreError> {
        Ok(self.exists_now(path, false)?.map(|(stat, _)| stat))
    }

    async fn exists_watch(&self, path: &str) -> Result<Option<DeletionWatch>, StoreError> {
        Ok(self.exists_now(path, true)?.and_then(|(_, deletion)| deletion))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.remove_now(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(store: &MemoryStore) -> Arc<MemoryClient> {
        let client = store.client();
        client.connect();
        assert_eq!(client.state(), SessionState::SyncConnected);
        client
    }

    #[tokio::test]
    async fn sequential_nodes_are_numbered_per_parent() {
        let store = MemoryStore::new();
        let client = connected(&store);
        client.create("/r", vec![], CreateMode::Persistent).await.expect("create /r");

        let a = client
            .create("/r/write-", vec![], CreateMode::EphemeralSequential)
            .await
            .expect("a");
        let b = client
            .create("/r/read-", vec![], CreateMode::EphemeralSequential)
            .await
            .expect("b");

        assert_eq!(a, "/r/write-0000000000");
        assert_eq!(b, "/r/read-0000000001");
        assert_eq!(store.children("/r"), vec!["read-0000000001", "write-0000000000"]);
    }

    #[tokio::test]
    async fn create_requires_parent_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let client = connected(&store);

        let missing_parent = client.create("/a/b", vec![], CreateMode::Persistent).await;
        assert!(matches!(missing_parent, Err(StoreError::NoNode)));

        client.create("/a", vec![], CreateMode::Persistent).await.expect("create /a");
        let dup = client.create("/a", vec![], CreateMode::Persistent).await;
        assert!(matches!(dup, Err(StoreError::NodeExists)));
    }

    #[tokio::test]
    async fn expiring_a_session_drops_its_ephemeral_nodes_and_fires_watches() {
        let store = MemoryStore::new();
        let owner = connected(&store);
        let observer = connected(&store);
        owner.create("/r", vec![], CreateMode::Persistent).await.expect("create /r");
        let node = owner
            .create("/r/write-", vec![], CreateMode::EphemeralSequential)
            .await
            .expect("create node");

        let watch = observer
            .exists_watch(&node)
            .await
            .expect("exists")
            .expect("node should exist");

        store.expire_session(owner.session_id());
        watch.await;

        assert_eq!(owner.state(), SessionState::Expired);
        assert!(!store.node_exists(&node));
        assert!(store.node_exists("/r"));
        assert!(matches!(
            owner.get_children("/r").await,
            Err(StoreError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn remove_reports_missing_and_non_empty_nodes() {
        let store = MemoryStore::new();
        let client = connected(&store);
        client.create("/a", vec![], CreateMode::Persistent).await.expect("create /a");
        client.create("/a/b", vec![], CreateMode::Persistent).await.expect("create /a/b");

        assert!(matches!(client.remove("/a").await, Err(StoreError::NotEmpty)));
        client.remove("/a/b").await.expect("remove /a/b");
        assert!(matches!(client.remove("/a/b").await, Err(StoreError::NoNode)));
    }

    #[tokio::test]
    async fn unreachable_store_keeps_sessions_connecting() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let client = store.client();
        client.connect();
        assert_eq!(client.state(), SessionState::Connecting);
        assert!(matches!(
            client.exists("/").await,
            Err(StoreError::ConnectionLoss)
        ));

        store.set_reachable(true);
        assert_eq!(client.state(), SessionState::SyncConnected);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_once() {
        let store = MemoryStore::new();
        let client = connected(&store);
        store.fail_next(Operation::GetChildren, StoreError::Injected("x".into()));

        assert!(client.get_children("/").await.is_err());
        assert!(client.get_children("/").await.is_ok());
    }
}
