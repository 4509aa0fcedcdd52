use std::time::Duration;

/// Frames one field within a probe request segment.
pub const WORD_SEP: char = '\u{0002}';
/// Frames one subscription's segment within a probe request.
pub const LINE_SEP: char = '\u{0001}';

/// Advertised on every outbound request via the `Client-Version` header.
pub const CLIENT_VERSION: &str = "diamond-client-rs/1.0.0";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(6_000);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(30_000);
pub const LONG_POLL_SERVER_TIMEOUT_MS: u64 = 30_000;
pub const LONG_POLL_TRANSPORT_TIMEOUT: Duration = Duration::from_millis(40_000);
pub const LONG_POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_TLS_PORT: u16 = 443;
pub const DEFAULT_PLAIN_PORT: u16 = 8080;
pub const DEFAULT_CACHE_DIR_NAME: &str = ".diamond-client-cache";
pub const DEFAULT_TENANT_KEY_SEGMENT: &str = "default_tenant";
