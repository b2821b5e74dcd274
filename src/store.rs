use {
    std::{
        fmt,
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    },
    tokio::sync::{broadcast, oneshot, watch},
};

///
/// How a node is created.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Deleted when the creating session ends, with a store-assigned 10-digit sequence suffix.
    EphemeralSequential,
}

///
/// Session state as reported by a [`CoordinationClient`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    SyncConnected,
    ConnectedReadOnly,
    Expired,
    AuthFailed,
    Closed,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::SyncConnected | Self::ConnectedReadOnly)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::SyncConnected => "SYNC_CONNECTED",
            Self::ConnectedReadOnly => "CONNECTED_READ_ONLY",
            Self::Expired => "EXPIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: i64,
    pub ephemeral: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node already exists")]
    NodeExists,
    #[error("node does not exist")]
    NoNode,
    #[error("node has children")]
    NotEmpty,
    #[error("connection loss")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
    #[error("gave up after repeated contention on {0}")]
    Contention(String),
    #[error("unexpected store content: {0}")]
    Corrupted(String),
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("injected failure: {0}")]
    Injected(String),
}

///
/// One-shot notification that resolves when a watched node is deleted.
///
/// It also resolves if the store drops the watch (e.g. the watch stream broke),
/// so waiters always get a chance to re-evaluate instead of hanging.
///
pub struct DeletionWatch {
    rx: oneshot::Receiver<()>,
}

impl DeletionWatch {
    pub fn channel() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for DeletionWatch {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

///
/// The subset of a ZooKeeper-like client the lock protocol consumes.
///
/// `connect` only initiates the session; completion is observed through [`CoordinationClient::subscribe`].
///
#[async_trait::async_trait]
pub trait CoordinationClient: Send + Sync {
    fn connect(&self);

    fn close(&self);

    fn state(&self) -> SessionState;

    fn session_timeout(&self) -> Duration;

    ///
    /// Stream of state transitions, in order.
    ///
    fn subscribe(&self) -> broadcast::Receiver<SessionState>;

    ///
    /// Creates `path` and returns the created path, which differs from `path`
    /// for sequential nodes.
    ///
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String, StoreError>;

    ///
    /// Lists child names (not full paths) of `path`, in no particular order.
    ///
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, StoreError>;

    ///
    /// Watches `path` for deletion. Returns `None` if the node does not exist at the time of the call.
    ///
    async fn exists_watch(&self, path: &str) -> Result<Option<DeletionWatch>, StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

///
/// Builds fresh clients against the same connection settings.
///
/// The session manager calls it once at construction and again after every session expiry.
///
pub trait ClientFactory: Send + Sync {
    fn create_client(&self) -> Arc<dyn CoordinationClient>;
}

impl<F> ClientFactory for F
where
    F: Fn() -> Arc<dyn CoordinationClient> + Send + Sync,
{
    fn create_client(&self) -> Arc<dyn CoordinationClient> {
        self()
    }
}

///
/// Holds the current [`SessionState`] of a client and publishes every transition.
///
pub struct SessionStateTracker {
    current: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
}

impl SessionStateTracker {
    pub fn new(initial: SessionState) -> Self {
        let (current, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(64);
        Self {
            current,
            transitions,
        }
    }

    pub fn get(&self) -> SessionState {
        *self.current.borrow()
    }

    ///
    /// Moves to `state`. Setting the state it already has is a no-op and publishes nothing.
    ///
    pub fn set(&self, state: SessionState) {
        let previous = self.current.send_replace(state);
        if previous != state {
            tracing::trace!("session state {previous} -> {state}");
            // No subscriber is fine.
            let _ = self.transitions.send(state);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }
}
