//! Shared helpers for the integration tests.

use std::future::Future;
use std::time::Duration;

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
