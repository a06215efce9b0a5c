//! Readiness polling for spawned servers.

use std::time::Duration;

async fn health_check(health_url: String) {
    loop {
        if let Ok(resp) = reqwest::get(&health_url).await
            && let Ok(resp) = resp.error_for_status()
            && let Ok(msg) = resp.text().await
            && msg == "healthy"
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::debug!("healthy: {health_url}");
}

/// Waits until the server behind `base_url` reports healthy.
pub async fn server_health_check(base_url: &str, max_wait_time: Duration) -> eyre::Result<()> {
    tokio::time::timeout(max_wait_time, health_check(format!("{base_url}/health")))
        .await
        .map_err(|_| eyre::eyre!("server not healthy in provided time: {max_wait_time:?}"))
}
