use {
    crate::{
        path::parent_path,
        retry::{default_strategy, is_auth_failure, is_not_found, retry_transient},
        store::{
            ClientFactory, CoordinationClient, CreateMode, DeletionWatch, NodeStat, SessionState,
            SessionStateTracker, StoreError,
        },
    },
    etcd_client::{
        Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, GetResponse,
        PutOptions, Txn, TxnOp, TxnOpResponse, TxnResponse, WatchFilterType, WatchOptions,
    },
    futures::StreamExt,
    rand::Rng,
    serde::Deserialize,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        sync::{broadcast, watch, OnceCell},
        time::Instant,
    },
    tracing::{error, info, trace, warn},
};

// Per-parent sequence counters live under this marker so that prefix scans of `<path>/` never see them.
const SEQUENCE_KEY_MARKER: &str = "\u{0}sequence";

const MAX_SEQUENCE_ATTEMPTS: u32 = 16;

const MIN_LEASE_TTL_SECS: i64 = 2;

///
/// Connection settings for the etcd-backed client.
///
/// ```
/// use zk_rwlock::etcd::EtcdConfig;
///
/// let config = EtcdConfig::from_json(r#"{ "endpoints": ["http://etcd:2379"], "session_timeout_ms": 10000 }"#)
///     .expect("invalid config");
/// assert_eq!(config.session_timeout().as_secs(), 10);
/// ```
///
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Prefix prepended to every node path, e.g. `/locks`.
    pub namespace: String,
    pub session_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            namespace: String::new(),
            session_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            user: None,
            password: None,
        }
    }
}

impl EtcdConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    ///
    /// Session lease TTL, rounded up to whole seconds, at least two seconds.
    ///
    pub fn lease_ttl_secs(&self) -> i64 {
        let secs = self.session_timeout_ms.div_ceil(1000) as i64;
        secs.max(MIN_LEASE_TTL_SECS)
    }

    fn connect_options(&self) -> ConnectOptions {
        let options =
            ConnectOptions::new().with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => options.with_user(user.clone(), password.clone()),
            _ => options,
        }
    }
}

///
/// Builds a fresh [`EtcdCoordinationClient`], i.e. a fresh session, on every call.
///
#[derive(Debug, Clone)]
pub struct EtcdClientFactory {
    config: Arc<EtcdConfig>,
}

impl EtcdClientFactory {
    pub fn new(config: EtcdConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ClientFactory for EtcdClientFactory {
    fn create_client(&self) -> Arc<dyn CoordinationClient> {
        Arc::new(EtcdCoordinationClient::new(Arc::clone(&self.config)))
    }
}

#[derive(Clone)]
struct Established {
    client: Client,
    lease_id: i64,
}

struct Shared {
    config: Arc<EtcdConfig>,
    state: SessionStateTracker,
    established: OnceCell<Established>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

///
/// ZooKeeper-like client on top of etcd.
///
/// A session is an etcd lease kept alive by a background task; ephemeral nodes are keys
/// attached to that lease, so they disappear when the lease is revoked or expires.
/// Each instance runs a single session: once it reports `Expired`, build a new client.
///
pub struct EtcdCoordinationClient {
    shared: Arc<Shared>,
}

impl Drop for EtcdCoordinationClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl EtcdCoordinationClient {
    pub fn new(config: Arc<EtcdConfig>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                state: SessionStateTracker::new(SessionState::Disconnected),
                established: OnceCell::new(),
                started: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.shared.config.namespace, path)
    }

    fn children_prefix(&self, path: &str) -> String {
        if path == "/" {
            self.key("/")
        } else {
            format!("{}/", self.key(path))
        }
    }

    fn sequence_key(&self, parent: &str) -> String {
        format!("{}{}{}", self.shared.config.namespace, SEQUENCE_KEY_MARKER, parent)
    }

    fn established(&self) -> Result<Established, StoreError> {
        match self.shared.state.get() {
            state if state.is_connected() => {}
            SessionState::Expired => return Err(StoreError::SessionExpired),
            _ => return Err(StoreError::ConnectionLoss),
        }
        self.shared
            .established
            .get()
            .cloned()
            .ok_or(StoreError::ConnectionLoss)
    }

    fn parent_guard(&self, path: &str) -> Option<Compare> {
        parent_path(path)
            .filter(|parent| *parent != "/")
            .map(|parent| Compare::version(self.key(parent), CompareOp::Greater, 0))
    }

    async fn get(&self, client: &Client, key: String, options: Option<GetOptions>) -> Result<GetResponse, StoreError> {
        let kv = client.kv_client();
        let response = retry_transient(default_strategy(), move || {
            let mut kv = kv.clone();
            let key = key.clone();
            let options = options.clone();
            async move { kv.get(key, options).await }
        })
        .await?;
        Ok(response)
    }

    async fn txn(&self, client: &Client, txn: Txn) -> Result<TxnResponse, StoreError> {
        let kv = client.kv_client();
        let response = retry_transient(default_strategy(), move || {
            let mut kv = kv.clone();
            let txn = txn.clone();
            async move { kv.txn(txn).await }
        })
        .await?;
        Ok(response)
    }

    async fn key_exists(&self, client: &Client, path: &str) -> Result<bool, StoreError> {
        if path == "/" {
            return Ok(true);
        }
        let response = self
            .get(client, self.key(path), Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(response.count() > 0)
    }

    async fn create_persistent(&self, est: &Established, path: &str, data: Vec<u8>) -> Result<String, StoreError> {
        if path == "/" {
            return Err(StoreError::NodeExists);
        }
        let key = self.key(path);
        let mut when = vec![Compare::version(key.clone(), CompareOp::Equal, 0)];
        when.extend(self.parent_guard(path));
        let txn = Txn::new()
            .when(when)
            .and_then(vec![TxnOp::put(key, data, None)]);

        if self.txn(&est.client, txn).await?.succeeded() {
            return Ok(path.to_string());
        }
        if self.key_exists(&est.client, path).await? {
            Err(StoreError::NodeExists)
        } else {
            Err(StoreError::NoNode)
        }
    }

    async fn create_ephemeral_sequential(
        &self,
        est: &Established,
        path: &str,
        data: Vec<u8>,
    ) -> Result<String, StoreError> {
        let parent = parent_path(path).unwrap_or("/");
        let counter_key = self.sequence_key(parent);

        for attempt in 0..MAX_SEQUENCE_ATTEMPTS {
            let counter = self.get(&est.client, counter_key.clone(), None).await?;
            let (sequence, counter_guard) = match counter.kvs().first() {
                Some(kv) => {
                    let sequence = std::str::from_utf8(kv.value())
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or_else(|| StoreError::Corrupted(format!("sequence counter of {parent}")))?;
                    let guard = Compare::mod_revision(counter_key.clone(), CompareOp::Equal, kv.mod_revision());
                    (sequence, guard)
                }
                None => (0, Compare::version(counter_key.clone(), CompareOp::Equal, 0)),
            };

            let created = format!("{path}{sequence:010}");
            let mut when = vec![counter_guard];
            when.extend(self.parent_guard(path));
            let txn = Txn::new().when(when).and_then(vec![
                TxnOp::put(counter_key.clone(), (sequence + 1).to_string(), None),
                TxnOp::put(
                    self.key(&created),
                    data.clone(),
                    Some(PutOptions::new().with_lease(est.lease_id)),
                ),
            ]);
            if self.txn(&est.client, txn).await?.succeeded() {
                return Ok(created);
            }
            if !self.key_exists(&est.client, parent).await? {
                return Err(StoreError::NoNode);
            }

            let jitter = rand::thread_rng().gen_range(1..=10u64);
            trace!("sequence counter of {parent} moved, retrying (attempt {attempt})");
            tokio::time::sleep(Duration::from_millis(jitter * u64::from(attempt + 1))).await;
        }
        Err(StoreError::Contention(parent.to_string()))
    }
}

#[async_trait::async_trait]
impl CoordinationClient for EtcdCoordinationClient {
    fn connect(&self) {
        if self.shared.state.get() != SessionState::Disconnected
            || self.shared.started.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.shared.state.set(SessionState::Connecting);
        tokio::spawn(run_session(Arc::clone(&self.shared)));
    }

    fn close(&self) {
        self.shared.shutdown.send_replace(true);
        if !self.shared.started.load(Ordering::Acquire) {
            self.shared.state.set(SessionState::Closed);
        }
    }

    fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    fn session_timeout(&self) -> Duration {
        self.shared.config.session_timeout()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String, StoreError> {
        let est = self.established()?;
        match mode {
            CreateMode::Persistent => self.create_persistent(&est, path, data).await,
            CreateMode::EphemeralSequential => self.create_ephemeral_sequential(&est, path, data).await,
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let est = self.established()?;
        let prefix = self.children_prefix(path);
        // Both reads in one transaction so the listing is consistent with the existence check.
        let txn = Txn::new().and_then(vec![
            TxnOp::get(self.key(path), Some(GetOptions::new().with_count_only())),
            TxnOp::get(prefix.clone(), Some(GetOptions::new().with_prefix().with_keys_only())),
        ]);
        let response = self.txn(&est.client, txn).await?;
        let mut gets = response.op_responses().into_iter().filter_map(|op| match op {
            TxnOpResponse::Get(get) => Some(get),
            _ => None,
        });
        let (Some(node), Some(listing)) = (gets.next(), gets.next()) else {
            return Err(StoreError::Corrupted(format!("listing of {path}")));
        };
        if path != "/" && node.count() == 0 {
            return Err(StoreError::NoNode);
        }
        Ok(listing
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, StoreError> {
        let est = self.established()?;
        if path == "/" {
            return Ok(Some(NodeStat {
                version: 0,
                ephemeral: false,
            }));
        }
        let response = self.get(&est.client, self.key(path), None).await?;
        Ok(response.kvs().first().map(|kv| NodeStat {
            version: kv.version(),
            ephemeral: kv.lease() != 0,
        }))
    }

    async fn exists_watch(&self, path: &str) -> Result<Option<DeletionWatch>, StoreError> {
        let est = self.established()?;
        let key = self.key(path);
        let response = self.get(&est.client, key.clone(), None).await?;
        if response.kvs().is_empty() {
            return Ok(None);
        }
        let revision = response
            .header()
            .map(|header| header.revision())
            .ok_or_else(|| StoreError::Corrupted(format!("response for {path} has no header")))?;

        // Starting right after the read revision leaves no gap in which a delete could be missed.
        let options = WatchOptions::new()
            .with_start_revision(revision + 1)
            .with_filters(vec![WatchFilterType::NoPut]);
        let wc = est.client.watch_client();
        let (mut watcher, mut stream) = retry_transient(default_strategy(), move || {
            let mut wc = wc.clone();
            let key = key.clone();
            let options = options.clone();
            async move { wc.watch(key, Some(options)).await }
        })
        .await?;

        let (mut tx, deletion) = DeletionWatch::channel();
        let path = path.to_string();
        tokio::spawn(async move {
            let deleted = loop {
                let next = tokio::select! {
                    resp = stream.next() => Some(resp),
                    _ = tx.closed() => None,
                };
                match next {
                    // Waiter gave up.
                    None => break false,
                    Some(Some(Ok(resp))) => {
                        if resp
                            .events()
                            .iter()
                            .any(|event| matches!(event.event_type(), EventType::Delete))
                        {
                            break true;
                        }
                        if resp.canceled() {
                            warn!("watch on {path} cancelled: {resp:?}");
                            break false;
                        }
                    }
                    Some(Some(Err(e))) => {
                        warn!("watch stream on {path} errored: {e:?}");
                        break false;
                    }
                    Some(None) => break false,
                }
            };
            if deleted {
                trace!("{path} deleted");
                let _ = tx.send(());
            }
            let _ = watcher.cancel().await;
        });
        Ok(Some(deletion))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let est = self.established()?;
        let children = self
            .get(
                &est.client,
                self.children_prefix(path),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await?;
        if children.count() > 0 {
            return Err(StoreError::NotEmpty);
        }
        let key = self.key(path);
        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::delete(key, None)]);
        if self.txn(&est.client, txn).await?.succeeded() {
            Ok(())
        } else {
            Err(StoreError::NoNode)
        }
    }
}

async fn run_session(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    if *shutdown.borrow_and_update() {
        shared.state.set(SessionState::Closed);
        return;
    }
    let config = Arc::clone(&shared.config);

    let connected = tokio::select! {
        result = Client::connect(config.endpoints.clone(), Some(config.connect_options())) => result,
        _ = shutdown.changed() => {
            shared.state.set(SessionState::Closed);
            return;
        }
    };
    let client = match connected {
        Ok(client) => client,
        Err(e) => return fail_session(&shared, e),
    };

    let ttl_secs = config.lease_ttl_secs();
    let lease = {
        let client = client.clone();
        retry_transient(default_strategy(), move || {
            let mut client = client.clone();
            async move { client.lease_grant(ttl_secs, None).await }
        })
        .await
    };
    let lease_id = match lease {
        Ok(lease) => lease.id(),
        Err(e) => return fail_session(&shared, e),
    };

    let _ = shared.established.set(Established {
        client: client.clone(),
        lease_id,
    });
    info!("etcd session established with lease {lease_id:x}");
    shared.state.set(SessionState::SyncConnected);

    keep_session_alive(&shared, client, lease_id, ttl_secs, shutdown).await;
}

fn fail_session(shared: &Shared, e: etcd_client::Error) {
    if is_auth_failure(&e) {
        error!("etcd authentication failed: {e}");
        shared.state.set(SessionState::AuthFailed);
    } else {
        error!("failed to establish etcd session: {e}");
        shared.state.set(SessionState::Disconnected);
    }
    // Allow another connect attempt.
    shared.started.store(false, Ordering::Release);
}

///
/// When to reopen a failed keep-alive: one renewal interval from now, capped by the lease
/// deadline. `None` once the deadline has passed.
///
fn reopen_at(now: Instant, lease_deadline: Instant, keepalive_interval: Duration) -> Option<Instant> {
    (now < lease_deadline).then(|| lease_deadline.min(now + keepalive_interval))
}

async fn keep_session_alive(
    shared: &Shared,
    client: Client,
    lease_id: i64,
    ttl_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let ttl = Duration::from_secs(ttl_secs as u64);
    let keepalive_interval = ttl / 2;
    let mut lease_deadline = Instant::now() + ttl;
    let mut reopening = false;

    'outer: loop {
        let Some(retry_at) = reopen_at(Instant::now(), lease_deadline, keepalive_interval) else {
            break 'outer;
        };
        if reopening {
            tokio::select! {
                _ = tokio::time::sleep_until(retry_at) => {}
                _ = shutdown.changed() => {
                    revoke_lease(shared, &client, lease_id).await;
                    return;
                }
            }
        }
        reopening = true;
        let keep_alive = {
            let client = client.clone();
            retry_transient(default_strategy(), move || {
                let mut client = client.clone();
                async move { client.lease_keep_alive(lease_id).await }
            })
            .await
        };
        let (mut keeper, mut stream) = match keep_alive {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to open keep alive for lease {lease_id:x}: {e:?}");
                shared.state.set(SessionState::Disconnected);
                continue 'outer;
            }
        };

        let mut next_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_renewal) => {
                    if let Err(e) = keeper.keep_alive().await {
                        warn!("failed to keep alive lease {lease_id:x}: {e:?}");
                        shared.state.set(SessionState::Disconnected);
                        continue 'outer;
                    }
                    match stream.next().await {
                        Some(Ok(resp)) => {
                            if resp.ttl() == 0 {
                                error!("lease {lease_id:x} expired");
                                break 'outer;
                            }
                            if resp.ttl() < ttl_secs {
                                warn!("lease {lease_id:x} ttl reduced to {}", resp.ttl());
                            }
                            lease_deadline = Instant::now() + Duration::from_secs(resp.ttl() as u64);
                            next_renewal = Instant::now() + keepalive_interval;
                            shared.state.set(SessionState::SyncConnected);
                            trace!("kept lease {lease_id:x} alive");
                        }
                        Some(Err(e)) => {
                            warn!("keep alive stream for lease {lease_id:x} errored: {e:?}");
                            shared.state.set(SessionState::Disconnected);
                            continue 'outer;
                        }
                        None => {
                            warn!("keep alive stream for lease {lease_id:x} ended");
                            shared.state.set(SessionState::Disconnected);
                            continue 'outer;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    revoke_lease(shared, &client, lease_id).await;
                    return;
                }
            }
        }
    }
    shared.state.set(SessionState::Expired);
}

async fn revoke_lease(shared: &Shared, client: &Client, lease_id: i64) {
    info!("revoking lease {lease_id:x}");
    let client = client.clone();
    let result = retry_transient(default_strategy(), move || {
        let mut client = client.clone();
        async move { client.lease_revoke(lease_id).await }
    })
    .await;
    match result {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => warn!("lease {lease_id:x} was already deleted"),
        Err(e) => error!("failed to revoke lease {lease_id:x}, got {e:?}"),
    }
    shared.state.set(SessionState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_overrides() {
        let config = EtcdConfig::from_json("{}").expect("empty config");
        assert_eq!(config.endpoints, vec!["http://localhost:2379"]);
        assert_eq!(config.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.lease_ttl_secs(), 30);

        let config = EtcdConfig::from_json(
            r#"{ "endpoints": ["http://a:2379", "http://b:2379"], "namespace": "/locks", "session_timeout_ms": 1500 }"#,
        )
        .expect("config");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.namespace, "/locks");
        assert_eq!(config.lease_ttl_secs(), 2);
    }

    #[test]
    fn keep_alive_reopen_waits_for_an_interval() {
        let now = Instant::now();
        let interval = Duration::from_secs(5);
        assert_eq!(reopen_at(now, now + Duration::from_secs(10), interval), Some(now + interval));
        assert_eq!(
            reopen_at(now, now + Duration::from_secs(2), interval),
            Some(now + Duration::from_secs(2))
        );
        assert_eq!(reopen_at(now, now, interval), None);
    }

    #[test]
    fn keys_are_namespaced() {
        let config = EtcdConfig {
            namespace: "/ns".to_string(),
            ..EtcdConfig::default()
        };
        let client = EtcdCoordinationClient::new(Arc::new(config));
        assert_eq!(client.key("/r/write-0000000001"), "/ns/r/write-0000000001");
        assert_eq!(client.children_prefix("/r"), "/ns/r/");
        assert_eq!(client.children_prefix("/"), "/ns/");
        assert!(!client.sequence_key("/r").starts_with("/ns/"));
    }

    #[test]
    fn operations_require_a_session() {
        let client = EtcdCoordinationClient::new(Arc::new(EtcdConfig::default()));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(matches!(client.established(), Err(StoreError::ConnectionLoss)));
        client.close();
        assert_eq!(client.state(), SessionState::Closed);
    }
}
