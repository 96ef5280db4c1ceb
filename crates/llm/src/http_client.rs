use std::time::Duration;

use reqwest::Client;

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        // No overall timeout: streams legitimately run for minutes. The
        // supervisor enforces idle and total-turn deadlines instead.
        .connect_timeout(Duration::from_secs(30))
        // A short pool idle timeout picks up provider DNS changes without
        // hurting throughput; same default the big gateways use.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

pub(crate) fn build_client(provider: &str) -> crate::Result<Client> {
    default_http_client_builder().build().map_err(|e| {
        log::error!("Failed to create HTTP client for {provider} provider: {e}");
        crate::LlmError::InternalError(None)
    })
}
