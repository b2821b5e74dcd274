use core::time::Duration;

use zk_rwlock::{
    etcd::{EtcdClientFactory, EtcdConfig},
    LockOptions, SessionManager,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let session = SessionManager::new(EtcdClientFactory::new(EtcdConfig::default()));
    assert!(session.connect().await, "failed to connect to etcd");

    let lock_name = "/example-lock";
    let mut my_lock = session.create_write_lock(lock_name);
    my_lock
        .acquire(LockOptions::default())
        .await
        .expect("failed to lock");
    println!("Lock acquired in main task: {:?}", my_lock.lock_absolute_path());

    // Same session, second handle: it queues behind the first one.
    let mut second = session.create_write_lock(lock_name);
    let h = tokio::spawn(async move {
        second
            .acquire(LockOptions::default().with_timeout(Duration::from_secs(30)))
            .await
            .expect("failed to lock");
        println!("Lock acquired in task 2: {:?}", second.lock_absolute_path());
        second.release().await.expect("failed to release");
    });

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Releasing lock!");
    my_lock.release().await.expect("failed to release");

    println!("Waiting for task 2 to acquire lock...");
    h.await.expect("task 2 failed to acquire lock");

    session.close();
    println!("Finished!");
}
