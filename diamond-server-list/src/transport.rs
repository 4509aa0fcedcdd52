use std::time::Duration;

/// Plain-text response from a discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryResponse {
    pub status: u16,
    pub body: String,
}

/// The HTTP contract the server list manager needs from its transport.
/// Discovery always talks plain HTTP (see spec §4.2); this is deliberately
/// narrower than the signed-request transport `diamond-client` uses.
pub trait DiscoveryTransport: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<DiscoveryResponse, String>;
}

/// Splits a discovery response body into trimmed, non-blank host lines.
pub fn parse_host_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
