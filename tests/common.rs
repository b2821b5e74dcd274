#![allow(dead_code)]

use {
    std::time::Duration,
    zk_rwlock::{
        etcd::{EtcdClientFactory, EtcdConfig},
        memory::MemoryStore,
        SessionManager,
    },
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn connected_memory_session() -> (MemoryStore, SessionManager) {
    init_tracing();
    let store = MemoryStore::new();
    let session = SessionManager::new(store.clone());
    assert!(session.connect().await, "failed to connect to memory store");
    (store, session)
}

///
/// Session against the etcd at localhost:2379, namespaced under a random prefix so tests do not collide.
///
pub async fn connected_etcd_session() -> SessionManager {
    init_tracing();
    let config = EtcdConfig {
        namespace: format!("/test-{}", random_str(10)),
        session_timeout_ms: 5_000,
        ..EtcdConfig::default()
    };
    let session = SessionManager::new(EtcdClientFactory::new(config));
    assert!(session.connect().await, "failed to connect to etcd");
    session
}

///
/// Polls `f` until it returns true, panicking after five seconds.
///
pub async fn eventually(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
