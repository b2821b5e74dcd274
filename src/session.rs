use {
    crate::{
        lock::{ReadLock, WriteLock},
        store::{ClientFactory, CoordinationClient, SessionState},
    },
    std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, MutexGuard, PoisonError, Weak,
        },
        time::Duration,
    },
    tokio::{
        sync::{broadcast, oneshot, watch},
        task::JoinHandle,
    },
    tracing::{info, trace, warn},
};

///
/// Events the session manager re-emits from the current client.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectedReadOnly,
    Disconnected,
    Expired,
    AuthenticationFailed,
    State(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Connected,
    ConnectedReadOnly,
    Disconnected,
    Expired,
    AuthenticationFailed,
    State,
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Connected => SessionEventKind::Connected,
            Self::ConnectedReadOnly => SessionEventKind::ConnectedReadOnly,
            Self::Disconnected => SessionEventKind::Disconnected,
            Self::Expired => SessionEventKind::Expired,
            Self::AuthenticationFailed => SessionEventKind::AuthenticationFailed,
            Self::State(_) => SessionEventKind::State,
        }
    }

    fn named(state: SessionState) -> Option<Self> {
        match state {
            SessionState::SyncConnected => Some(Self::Connected),
            SessionState::ConnectedReadOnly => Some(Self::ConnectedReadOnly),
            SessionState::Disconnected => Some(Self::Disconnected),
            SessionState::Expired => Some(Self::Expired),
            SessionState::AuthFailed => Some(Self::AuthenticationFailed),
            SessionState::Connecting | SessionState::Closed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: SessionEventKind,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<Registration>>,
}

impl ListenerRegistry {
    fn entries(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, kind: SessionEventKind, once: bool, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push(Registration {
            id,
            kind,
            once,
            callback,
        });
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|r| r.id != id);
        entries.len() != before
    }

    fn remove_all(&self, kind: Option<SessionEventKind>) {
        let mut entries = self.entries();
        match kind {
            Some(kind) => entries.retain(|r| r.kind != kind),
            None => entries.clear(),
        }
    }

    fn count(&self, kind: SessionEventKind) -> usize {
        self.entries().iter().filter(|r| r.kind == kind).count()
    }

    fn emit(&self, event: SessionEvent) {
        // Callbacks run outside the lock so they may (un)register listeners themselves.
        let callbacks: Vec<Callback> = {
            let mut entries = self.entries();
            let kind = event.kind();
            let matched = entries
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| Arc::clone(&r.callback))
                .collect();
            entries.retain(|r| !(r.once && r.kind == kind));
            matched
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}

struct Inner {
    factory: Box<dyn ClientFactory>,
    client: watch::Sender<Arc<dyn CoordinationClient>>,
    connecting: AtomicBool,
    listeners: ListenerRegistry,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    orphaned_lock_nodes: AtomicU64,
}

impl Inner {
    fn forwarder(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.forwarder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder().take() {
            handle.abort();
        }
        self.client.borrow().close();
    }
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

///
/// Owns one logical session to the coordination store.
///
/// The manager survives session expiry: when the current client reports `Expired`, it is closed,
/// a new one is built from the same [`ClientFactory`] and connected again. Anything holding a lock
/// at that moment must assume its lock node is gone.
///
/// Always go through [`SessionManager::client`] right before a store call; the handle is replaced on expiry.
///
/// Cloning is cheap and every clone shares the same session. Must be created inside a tokio runtime.
///
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new<F>(factory: F) -> Self
    where
        F: ClientFactory + 'static,
    {
        let client = factory.create_client();
        let (client_tx, _) = watch::channel(Arc::clone(&client));
        let manager = Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                client: client_tx,
                connecting: AtomicBool::new(false),
                listeners: ListenerRegistry::default(),
                forwarder: Mutex::new(None),
                orphaned_lock_nodes: AtomicU64::new(0),
            }),
        };
        manager.spawn_forwarder(client);
        manager
    }

    ///
    /// Brings the session up.
    ///
    /// Returns `true` if the session is connected (possibly read-only) when this returns. Returns
    /// `false` if another `connect` is already in flight, if the client is neither connected nor
    /// disconnected, or if no connection was established within the session timeout.
    ///
    pub async fn connect(&self) -> bool {
        if self.inner.connecting.swap(true, Ordering::AcqRel) {
            trace!("connect already in flight");
            return false;
        }
        let _guard = ConnectingGuard(&self.inner.connecting);

        let client = self.client();
        match client.state() {
            state if state.is_connected() => true,
            SessionState::Disconnected => {
                let (tx, rx) = oneshot::channel();
                let tx = Mutex::new(Some(tx));
                let listener = self.once(SessionEventKind::Connected, move |_| {
                    if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                        let _ = tx.send(());
                    }
                });
                client.connect();
                let session_timeout = client.session_timeout();
                let connected = matches!(tokio::time::timeout(session_timeout, rx).await, Ok(Ok(())));
                if connected {
                    info!("session connected");
                } else {
                    self.remove_listener(listener);
                    warn!("session did not connect within {session_timeout:?}");
                }
                connected
            }
            other => {
                trace!("cannot connect from state {other}");
                false
            }
        }
    }

    ///
    /// The current client. Do not hold on to it across suspension points.
    ///
    pub fn client(&self) -> Arc<dyn CoordinationClient> {
        Arc::clone(&self.inner.client.borrow())
    }

    pub fn state(&self) -> SessionState {
        self.client().state()
    }

    pub fn session_timeout(&self) -> Duration {
        self.client().session_timeout()
    }

    ///
    /// Number of lock nodes that were abandoned (timeout or error) but could not be removed.
    ///
    /// Each of them stays in the store until this session ends.
    ///
    pub fn orphaned_lock_nodes(&self) -> u64 {
        self.inner.orphaned_lock_nodes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_orphaned_lock_node(&self) {
        self.inner.orphaned_lock_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn create_read_lock(&self, path: &str) -> ReadLock {
        ReadLock::new(self.clone(), path)
    }

    pub fn create_write_lock(&self, path: &str) -> WriteLock {
        WriteLock::new(self.clone(), path)
    }

    pub fn on<F>(&self, kind: SessionEventKind, f: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(kind, false, Arc::new(f))
    }

    ///
    /// Like [`SessionManager::on`], but the listener is removed after its first call.
    ///
    pub fn once<F>(&self, kind: SessionEventKind, f: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(kind, true, Arc::new(f))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn remove_all_listeners(&self, kind: Option<SessionEventKind>) {
        self.inner.listeners.remove_all(kind)
    }

    pub fn listener_count(&self, kind: SessionEventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    ///
    /// Closes the current client. Ephemeral nodes of the session go away with it.
    ///
    pub fn close(&self) {
        if let Some(handle) = self.inner.forwarder().take() {
            handle.abort();
        }
        self.client().close();
    }

    fn dispatch(&self, state: SessionState) {
        self.inner.listeners.emit(SessionEvent::State(state));
        if let Some(event) = SessionEvent::named(state) {
            self.inner.listeners.emit(event);
        }
    }

    fn spawn_forwarder(&self, client: Arc<dyn CoordinationClient>) {
        let rx = client.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(forward_events(weak, client, rx));
        // The previous forwarder may be the task calling us, so it is detached rather than aborted.
        let _ = self.inner.forwarder().replace(handle);
    }

    fn is_current(&self, client: &Arc<dyn CoordinationClient>) -> bool {
        let current = self.inner.client.borrow();
        std::ptr::addr_eq(Arc::as_ptr(&current), Arc::as_ptr(client))
    }

    fn rebuild_after_expiry(&self, expired: Arc<dyn CoordinationClient>) {
        if !self.is_current(&expired) {
            return;
        }
        warn!("session expired, rebuilding client");
        expired.close();
        let client = self.inner.factory.create_client();
        self.inner.client.send_replace(Arc::clone(&client));
        self.spawn_forwarder(client);

        let manager = self.clone();
        tokio::spawn(async move {
            if !manager.connect().await {
                warn!("reconnect after session expiry did not complete");
            }
        });
    }
}

async fn forward_events(
    weak: Weak<Inner>,
    client: Arc<dyn CoordinationClient>,
    mut rx: broadcast::Receiver<SessionState>,
) {
    loop {
        let state = match rx.recv().await {
            Ok(state) => state,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("session event forwarder lagged, skipped {skipped} state(s)");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let manager = SessionManager { inner };
        if !manager.is_current(&client) {
            break;
        }
        manager.dispatch(state);
        if state == SessionState::Expired {
            manager.rebuild_after_expiry(client);
            break;
        }
    }
    trace!("session event forwarder exiting");
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::memory::MemoryStore,
        std::sync::atomic::AtomicUsize,
    };

    #[tokio::test]
    async fn connect_should_accept_a_read_only_session() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store.clone());
        store.set_session_state(1, SessionState::ConnectedReadOnly);
        assert!(session.connect().await);

        store.set_session_state(1, SessionState::Connecting);
        assert!(!session.connect().await);
    }

    #[tokio::test]
    async fn connect_should_succeed_and_be_idempotent() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store);
        assert_eq!(session.state(), SessionState::Disconnected);

        assert!(session.connect().await);
        assert_eq!(session.state(), SessionState::SyncConnected);
        assert!(session.connect().await);
        assert_eq!(session.listener_count(SessionEventKind::Connected), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_should_time_out_after_session_timeout() {
        let store = MemoryStore::with_session_timeout(Duration::from_secs(5));
        store.set_reachable(false);
        let session = SessionManager::new(store);

        let started = tokio::time::Instant::now();
        assert!(!session.connect().await);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(session.listener_count(SessionEventKind::Connected), 0);

        // Stuck mid-connect: neither connected nor disconnected.
        assert!(!session.connect().await);
    }

    #[tokio::test]
    async fn concurrent_connect_should_return_false() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let session = SessionManager::new(store.clone());

        let s2 = session.clone();
        let first = tokio::spawn(async move { s2.connect().await });
        tokio::task::yield_now().await;
        while session.state() != SessionState::Connecting {
            tokio::task::yield_now().await;
        }
        assert!(!session.connect().await);

        store.set_reachable(true);
        assert!(first.await.expect("join"));
    }

    #[tokio::test]
    async fn listeners_receive_named_and_state_events() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store);
        let connected = Arc::new(AtomicUsize::new(0));
        let states = Arc::new(Mutex::new(vec![]));

        let c = Arc::clone(&connected);
        session.on(SessionEventKind::Connected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&states);
        session.on(SessionEventKind::State, move |event| {
            if let SessionEvent::State(state) = event {
                s.lock().expect("lock").push(*state);
            }
        });

        assert!(session.connect().await);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(
            *states.lock().expect("lock"),
            vec![SessionState::Connecting, SessionState::SyncConnected]
        );
    }

    #[tokio::test]
    async fn once_and_remove_listener() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store);
        let id = session.on(SessionEventKind::Disconnected, |_| {});
        session.once(SessionEventKind::Disconnected, |_| {});
        assert_eq!(session.listener_count(SessionEventKind::Disconnected), 2);

        session.dispatch(SessionState::Disconnected);
        assert_eq!(session.listener_count(SessionEventKind::Disconnected), 1);

        assert!(session.remove_listener(id));
        assert!(!session.remove_listener(id));
        session.on(SessionEventKind::Expired, |_| {});
        session.remove_all_listeners(Some(SessionEventKind::Expired));
        assert_eq!(session.listener_count(SessionEventKind::Expired), 0);
    }

    #[tokio::test]
    async fn expiry_should_rebuild_and_reconnect_the_client() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store.clone());
        assert!(session.connect().await);
        let first = session.client();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        session.on(SessionEventKind::Connected, move |_| {
            if let Some(tx) = tx.lock().expect("lock").take() {
                let _ = tx.send(());
            }
        });
        let expired = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&expired);
        session.on(SessionEventKind::Expired, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        // The first client was the first session handed out by the store.
        store.expire_session(1);
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("reconnect timed out")
            .expect("listener dropped");

        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(first.state(), SessionState::Closed);
        assert!(!session.is_current(&first));
        assert_eq!(session.state(), SessionState::SyncConnected);
    }
}
