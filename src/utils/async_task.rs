use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Runs `task` until it succeeds, retrying with exponential backoff.
///
/// Every attempt is bounded by `policy.timeout_ms`. Only errors for which
/// [`Error::is_retryable`] holds are retried; any other error is returned
/// immediately. `policy.max_retries == 0` retries forever.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: std::future::Future<Output = Result<P>>,
{
    let mut retries = 0;
    let mut last_error;
    loop {
        match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => {
                return Ok(r); // Exit on success
            }
            Ok(Err(error)) => {
                if !error.is_retryable() {
                    return Err(error);
                }
                warn!("failed with error: {:?}", &error);
                last_error = error;
            }
            Err(_elapsed) => {
                warn!("task_with_timeout_and_exponential_backoff timeout after {:?}", policy.timeout());
                last_error = Error::RetryTimeout(policy.timeout());
            }
        };

        retries += 1;
        if policy.max_retries != 0 && retries >= policy.max_retries {
            warn!("Task failed after {} retries", retries);
            return Err(Error::RetryTaskFailed(format!(
                "task failed after {retries} attempts: {last_error}"
            )));
        }
        sleep(policy.delay_for(retries - 1)).await;
    }
}

// Helper function to spawn tasks and log how they ended
pub(crate) fn spawn_task<F, Fut, P>(
    name: &str,
    task_fn: F,
) -> tokio::task::JoinHandle<Option<P>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<P>> + Send + 'static,
    P: Send + 'static,
{
    // Clone the name so it can be safely moved into the async block
    let name = name.to_string();
    tokio::spawn(async move {
        match task_fn().await {
            Ok(p) => Some(p),
            Err(e) => {
                error!("spawned task: {name} stopped or encountered an error: {:?}", e);
                None
            }
        }
    })
}
