use core::time::Duration;

use zk_rwlock::{
    etcd::{EtcdClientFactory, EtcdConfig},
    LockError, LockOptions, SessionEventKind, SessionManager,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(json) => EtcdConfig::from_json(&json).expect("invalid config"),
        None => EtcdConfig::default(),
    };
    let session = SessionManager::new(EtcdClientFactory::new(config));
    session.on(SessionEventKind::State, |event| println!("session event: {event:?}"));
    assert!(session.connect().await, "failed to connect to etcd");

    let resource = "/example-rw";
    let mut reader1 = session.create_read_lock(resource);
    let mut reader2 = session.create_read_lock(resource);
    reader1.acquire(LockOptions::default()).await.expect("reader 1");
    reader2.acquire(LockOptions::default()).await.expect("reader 2");
    println!(
        "Both readers hold the lock, read locked: {}",
        reader1.is_type_locked().await.expect("failed to check lock type")
    );

    let mut writer = session.create_write_lock(resource);
    match writer
        .acquire(LockOptions::default().with_timeout(Duration::from_millis(500)))
        .await
    {
        Err(LockError::OperationTimedOut { timeout }) => {
            println!("Writer timed out after {timeout:?} while readers hold the lock")
        }
        other => panic!("writer should have timed out, got {other:?}"),
    }

    reader1.release().await.expect("release reader 1");
    reader2.release().await.expect("release reader 2");

    writer
        .acquire(LockOptions::default().with_data("writer"))
        .await
        .expect("writer");
    println!(
        "Writer holds the lock, read locked: {}",
        reader1.is_type_locked().await.expect("failed to check lock type")
    );
    writer.release().await.expect("release writer");

    session.close();
}
