use {
    crate::{
        path::{
            does_lower_sequence_number_child_path_exist, get_next_lowest_sequence_number_child_path,
            normalize_path, sequence_number, PathUtility, READ_LOCK_PREFIX, WRITE_LOCK_PREFIX,
        },
        session::SessionManager,
        store::{CreateMode, SessionState, StoreError},
    },
    std::{fmt, marker::PhantomData, time::Duration},
    thiserror::Error,
    tokio::task::JoinHandle,
    tracing::{error, info, trace, warn},
};

pub const UNEXPECTED_ERROR: u32 = 10_000_000;
pub const OPERATION_TIMED_OUT: u32 = 10_000_001;
pub const NOT_CONNECTED: u32 = 10_000_002;

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Acquire,
    TryAcquire,
    Release,
    IsTypeLocked,
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquire => f.write_str("acquire"),
            Self::TryAcquire => f.write_str("try acquire"),
            Self::Release => f.write_str("release"),
            Self::IsTypeLocked => f.write_str("check lock type"),
        }
    }
}

///
/// Failure of a lock operation.
///
/// Store errors are logged and collapsed into [`LockError::Unexpected`]; callers only branch on the kind.
///
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("session is not connected")]
    NotConnected,
    #[error("acquiring the lock timed out after {timeout:?}")]
    OperationTimedOut { timeout: Duration },
    #[error("unexpected error while trying to {operation} the lock")]
    Unexpected { operation: LockOperation },
}

impl LockError {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotConnected => NOT_CONNECTED,
            Self::OperationTimedOut { .. } => OPERATION_TIMED_OUT,
            Self::Unexpected { .. } => UNEXPECTED_ERROR,
        }
    }
}

///
/// Options for [`FairLock::acquire`] and [`FairLock::try_acquire`].
///
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Payload stored in the lock node.
    pub data: Vec<u8>,
    /// Upper bound on the whole acquisition. `try_acquire` only uses it to bound cleanup.
    pub timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl LockOptions {
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

///
/// What distinguishes a read lock from a write lock: the name of its own node, and which siblings it queues behind.
///
pub trait LockKind: Send + Sync + 'static {
    const PREFIX: &'static str;

    fn blocks_on(sibling: &str) -> bool;
}

///
/// Shared lock. Only earlier write nodes block it.
///
#[derive(Debug)]
pub struct Read;

///
/// Exclusive lock. Every earlier node blocks it.
///
#[derive(Debug)]
pub struct Write;

impl LockKind for Read {
    const PREFIX: &'static str = READ_LOCK_PREFIX;

    fn blocks_on(sibling: &str) -> bool {
        sibling.starts_with(WRITE_LOCK_PREFIX)
    }
}

impl LockKind for Write {
    const PREFIX: &'static str = WRITE_LOCK_PREFIX;

    fn blocks_on(_sibling: &str) -> bool {
        true
    }
}

///
/// Lock node of one acquisition attempt.
///
/// The create runs in its own task, so a node the store commits after the caller gave up is
/// still known and can be removed.
///
#[derive(Default)]
struct Attempt {
    creating: Option<JoinHandle<Result<String, StoreError>>>,
    created: Option<String>,
}

pub type ReadLock = FairLock<Read>;
pub type WriteLock = FairLock<Write>;

///
/// A fair, queue-based lock on a node of the coordination store.
///
/// Acquiring creates an ephemeral sequential child `<prefix><10 digits>` under the resource node
/// and waits until no blocking sibling has a lower sequence number. Waiting watches only the
/// immediate blocking predecessor, so a release wakes a single waiter.
///
/// Ownership is never cached beyond [`FairLock::lock_absolute_path`]: it is re-derived from the
/// children list on every check. If the session expires while the lock is held, the lock node
/// is gone even though `lock_absolute_path` is still set.
///
pub struct FairLock<K: LockKind> {
    session: SessionManager,
    paths: PathUtility,
    node_absolute_path: String,
    lock_absolute_path: Option<String>,
    _kind: PhantomData<K>,
}

impl<K: LockKind> fmt::Debug for FairLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairLock")
            .field("kind", &K::PREFIX)
            .field("node_absolute_path", &self.node_absolute_path)
            .field("lock_absolute_path", &self.lock_absolute_path)
            .finish()
    }
}

impl<K: LockKind> FairLock<K> {
    pub fn new(session: SessionManager, path: &str) -> Self {
        Self {
            paths: PathUtility::new(session.clone()),
            session,
            node_absolute_path: normalize_path(&[path]),
            lock_absolute_path: None,
            _kind: PhantomData,
        }
    }

    pub fn node_absolute_path(&self) -> &str {
        &self.node_absolute_path
    }

    ///
    /// Path of the lock node this handle holds, `None` when not held.
    ///
    pub fn lock_absolute_path(&self) -> Option<&str> {
        self.lock_absolute_path.as_deref()
    }

    ///
    /// Path passed to the store when creating this handle's sequential node, e.g. `/resource/write-`.
    ///
    pub fn create_lock_path(&self) -> String {
        normalize_path(&[self.node_absolute_path.as_str(), K::PREFIX])
    }

    fn ensure_connected(&self) -> Result<(), LockError> {
        let state = self.session.state();
        if state != SessionState::SyncConnected {
            trace!("{} refused, session is {state}", self.node_absolute_path);
            return Err(LockError::NotConnected);
        }
        Ok(())
    }

    fn blocking_children(children: Vec<String>) -> Vec<String> {
        children.into_iter().filter(|c| K::blocks_on(c)).collect()
    }

    ///
    /// Waits for the lock, for at most `options.timeout`.
    ///
    /// On timeout or store failure the node created for this attempt is removed before returning.
    /// A create still in flight when the timeout fires is left to finish in the background, and the
    /// node it produces is removed then. If a removal fails the node is left to the session and counted in
    /// [`SessionManager::orphaned_lock_nodes`]; the timeout or store error is still the one returned.
    ///
    pub async fn acquire(&mut self, options: LockOptions) -> Result<(), LockError> {
        let LockOptions { data, timeout } = options;
        self.ensure_connected()?;

        let mut attempt = Attempt::default();
        let outcome = tokio::time::timeout(timeout, self.enqueue_and_wait(data, &mut attempt)).await;
        match outcome {
            Ok(Ok(path)) => {
                info!("acquired {path}");
                self.lock_absolute_path = Some(path);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("failed to acquire lock on {}: {e}", self.node_absolute_path);
                self.abandon(attempt, timeout).await;
                Err(LockError::Unexpected {
                    operation: LockOperation::Acquire,
                })
            }
            Err(_elapsed) => {
                warn!(
                    "acquiring lock on {} timed out after {timeout:?}",
                    self.node_absolute_path
                );
                self.abandon(attempt, timeout).await;
                Err(LockError::OperationTimedOut { timeout })
            }
        }
    }

    async fn create_lock_node(&self, data: Vec<u8>, attempt: &mut Attempt) -> Result<String, StoreError> {
        let client = self.session.client();
        let path = self.create_lock_path();
        let creating = attempt.creating.insert(tokio::spawn(async move {
            client.create(&path, data, CreateMode::EphemeralSequential).await
        }));
        let created = creating.await;
        attempt.creating = None;
        let own = created??;
        attempt.created = Some(own.clone());
        trace!("created lock node {own}");
        Ok(own)
    }

    async fn enqueue_and_wait(&self, data: Vec<u8>, attempt: &mut Attempt) -> Result<String, StoreError> {
        self.paths.ensure_path_exists(&self.node_absolute_path).await?;
        let own = self.create_lock_node(data, attempt).await?;

        loop {
            let children = self.session.client().get_children(&self.node_absolute_path).await?;
            let blocking = Self::blocking_children(children);
            if !does_lower_sequence_number_child_path_exist(&own, &blocking) {
                return Ok(own);
            }
            let Some(predecessor) = get_next_lowest_sequence_number_child_path(&own, &blocking) else {
                return Ok(own);
            };
            let predecessor = normalize_path(&[self.node_absolute_path.as_str(), predecessor]);

            match self.session.client().exists_watch(&predecessor).await? {
                Some(deletion) => {
                    trace!("{own} waiting on {predecessor}");
                    deletion.await;
                }
                None => trace!("{predecessor} already gone"),
            }
        }
    }

    async fn abandon(&self, attempt: Attempt, timeout: Duration) {
        if let Some(path) = attempt.created {
            remove_abandoned(&self.session, &path, timeout).await;
            return;
        }
        let Some(creating) = attempt.creating else {
            return;
        };
        // Whatever the pending create returns is removed once it lands.
        let session = self.session.clone();
        tokio::spawn(async move {
            match creating.await {
                Ok(Ok(path)) => {
                    trace!("create of abandoned lock node {path} completed late");
                    remove_abandoned(&session, &path, timeout).await;
                }
                Ok(Err(e)) => trace!("create of abandoned lock node failed: {e}"),
                Err(e) => {
                    warn!("create of abandoned lock node did not complete: {e}");
                    session.record_orphaned_lock_node();
                }
            }
        });
    }

    ///
    /// Takes the lock only if nothing blocks it right now.
    ///
    /// `Ok(false)` means the lock is busy; the node created for the attempt has been removed.
    ///
    pub async fn try_acquire(&mut self, options: LockOptions) -> Result<bool, LockError> {
        self.ensure_connected()?;

        let mut attempt = Attempt::default();
        match self.enqueue_once(options.data, &mut attempt).await {
            Ok(Some(path)) => {
                info!("acquired {path}");
                self.lock_absolute_path = Some(path);
                Ok(true)
            }
            Ok(None) => {
                trace!("lock on {} is busy", self.node_absolute_path);
                Ok(false)
            }
            Err(e) => {
                error!("failed to try-acquire lock on {}: {e}", self.node_absolute_path);
                self.abandon(attempt, options.timeout).await;
                Err(LockError::Unexpected {
                    operation: LockOperation::TryAcquire,
                })
            }
        }
    }

    async fn enqueue_once(&self, data: Vec<u8>, attempt: &mut Attempt) -> Result<Option<String>, StoreError> {
        self.paths.ensure_path_exists(&self.node_absolute_path).await?;
        let own = self.create_lock_node(data, attempt).await?;

        let children = self.session.client().get_children(&self.node_absolute_path).await?;
        let blocking = Self::blocking_children(children);
        if !does_lower_sequence_number_child_path_exist(&own, &blocking) {
            return Ok(Some(own));
        }

        self.session.client().remove(&own).await?;
        attempt.created = None;
        Ok(None)
    }

    ///
    /// Releases the lock.
    ///
    /// A lock node that is already gone (session expiry, external removal) counts as released,
    /// and so does releasing a handle that holds nothing.
    ///
    pub async fn release(&mut self) -> Result<(), LockError> {
        self.ensure_connected()?;
        if let Some(path) = self.lock_absolute_path.as_deref() {
            match self.session.client().remove(path).await {
                Ok(()) => info!("released {path}"),
                Err(StoreError::NoNode) => warn!("lock node {path} was already deleted"),
                Err(e) => {
                    error!("failed to release {path}: {e}");
                    return Err(LockError::Unexpected {
                        operation: LockOperation::Release,
                    });
                }
            }
        }
        self.lock_absolute_path = None;
        Ok(())
    }
}

async fn remove_abandoned(session: &SessionManager, path: &str, timeout: Duration) {
    let removal = tokio::time::timeout(timeout, session.client().remove(path)).await;
    match removal {
        Ok(Ok(())) | Ok(Err(StoreError::NoNode)) => trace!("removed abandoned lock node {path}"),
        Ok(Err(e)) => {
            warn!("failed to remove abandoned lock node {path}: {e}");
            session.record_orphaned_lock_node();
        }
        Err(_elapsed) => {
            warn!("removing abandoned lock node {path} timed out");
            session.record_orphaned_lock_node();
        }
    }
}

impl FairLock<Read> {
    ///
    /// Whether the current holder of the resource, if any, is a reader.
    ///
    /// The holder is the child with the lowest sequence number. A resource that was never locked is not read-locked.
    ///
    pub async fn is_type_locked(&self) -> Result<bool, LockError> {
        self.ensure_connected()?;
        match self.session.client().get_children(&self.node_absolute_path).await {
            Ok(children) => Ok(children
                .iter()
                .filter_map(|child| sequence_number(child).map(|seq| (seq, child)))
                .min_by_key(|(seq, _)| *seq)
                .is_some_and(|(_, child)| child.starts_with(READ_LOCK_PREFIX))),
            Err(StoreError::NoNode) => Ok(false),
            Err(e) => {
                error!("failed to list {}: {e}", self.node_absolute_path);
                Err(LockError::Unexpected {
                    operation: LockOperation::IsTypeLocked,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::memory::MemoryStore};

    async fn connected_session() -> (MemoryStore, SessionManager) {
        let store = MemoryStore::new();
        let session = SessionManager::new(store.clone());
        assert!(session.connect().await);
        (store, session)
    }

    #[test]
    fn error_codes() {
        assert_eq!(LockError::NotConnected.code(), 10_000_002);
        assert_eq!(
            LockError::OperationTimedOut {
                timeout: Duration::from_millis(5)
            }
            .code(),
            10_000_001
        );
        assert_eq!(
            LockError::Unexpected {
                operation: LockOperation::Release
            }
            .code(),
            10_000_000
        );
    }

    #[test]
    fn kinds_block_on_the_right_siblings() {
        assert!(Read::blocks_on("write-0000000001"));
        assert!(!Read::blocks_on("read-0000000001"));
        assert!(Write::blocks_on("read-0000000001"));
        assert!(Write::blocks_on("write-0000000001"));
    }

    #[tokio::test]
    async fn construction_normalizes_path() {
        let (_store, session) = connected_session().await;
        let lock = session.create_write_lock("resource//a/");
        assert_eq!(lock.node_absolute_path(), "/resource/a");
        assert_eq!(lock.create_lock_path(), "/resource/a/write-");
        assert_eq!(lock.lock_absolute_path(), None);

        let lock = session.create_read_lock("/resource/a");
        assert_eq!(lock.create_lock_path(), "/resource/a/read-");
    }

    #[tokio::test]
    async fn acquire_then_release_clears_lock_path() {
        let (store, session) = connected_session().await;
        let mut lock = session.create_write_lock("/r");

        lock.acquire(LockOptions::default()).await.expect("acquire");
        assert_eq!(lock.lock_absolute_path(), Some("/r/write-0000000000"));
        assert_eq!(store.children("/r"), vec!["write-0000000000"]);

        lock.release().await.expect("release");
        assert_eq!(lock.lock_absolute_path(), None);
        assert!(store.children("/r").is_empty());
    }

    #[tokio::test]
    async fn release_without_holding_is_a_no_op() {
        let (_store, session) = connected_session().await;
        let mut lock = session.create_read_lock("/r");
        lock.release().await.expect("release");
    }
}
