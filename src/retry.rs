use {
    retry::delay::Exponential,
    std::{error::Error, future::Future, time::Duration},
    tonic::Code,
    tracing::{error, warn},
};

///
/// True for errors caused by outside forces (network partition, overloaded or restarting
/// members) that are worth retrying.
///
pub fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            Code::Unknown => status.source().is_none(),
            Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unavailable
            | Code::DataLoss => true,
            _ => false,
        },
        _ => false,
    }
}

pub fn is_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status) if status.code() == Code::NotFound)
}

pub fn is_auth_failure(err: &etcd_client::Error) -> bool {
    matches!(
        err,
        etcd_client::Error::GRpcStatus(status)
            if matches!(status.code(), Code::Unauthenticated | Code::PermissionDenied)
    )
}

///
/// Three retries, 10ms then 100ms then 1s apart.
///
pub fn default_strategy() -> impl Iterator<Item = Duration> {
    Exponential::from_millis_with_factor(10, 10.0).take(3)
}

///
/// Retries `f` on transient errors only, following `retry_strategy`.
///
/// Non-transient errors, e.g. "not found", are returned right away.
///
/// ```no_run
/// use zk_rwlock::retry::{default_strategy, retry_transient};
///
/// # async fn run(etcd: etcd_client::Client) -> Result<(), etcd_client::Error> {
/// let response = retry_transient(default_strategy(), || {
///     let mut kv = etcd.kv_client();
///     async move { kv.get("/resource", None).await }
/// })
/// .await?;
/// # let _ = response;
/// # Ok(())
/// # }
/// ```
///
pub async fn retry_transient<T, F, Fut>(
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, etcd_client::Error>
where
    Fut: Future<Output = Result<T, etcd_client::Error>>,
    F: FnMut() -> Fut,
{
    let mut retry_strategy = retry_strategy.into_iter();
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) if is_transient(&e) => {
                warn!("failed due to transient state {:?}", e);
                match retry_strategy.next() {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => return Err(e),
                }
            }
            Err(e) => {
                if !is_not_found(&e) {
                    error!("failed due to non-transient state: {:?}", e);
                }
                return Err(e);
            }
        }
    }
}
