//! Polling assertion for asynchronously settling state.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Works under a paused tokio clock: sleeping auto-advances time.
///
/// # Example
///
/// ```rust,ignore
/// assert_eventually(Duration::from_secs(1), || async {
///     registry.get_status().await.unwrap().room_count == 0
/// })
/// .await
/// .expect("room should close");
/// ```
pub async fn assert_eventually<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(format!("Condition not met within {timeout:?}"));
        }
        sleep(POLL_INTERVAL).await;
    }
}
