use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{DEFAULT_CACHE_DIR_NAME, DEFAULT_REFRESH_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
use crate::error::DiamondError;

/// Validated, immutable configuration for a [`crate::Facade`].
///
/// Built exclusively through [`ConfigBuilder`] -- there is no public
/// constructor that can produce an invalid `Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub namespace: String,
    pub access_key: String,
    pub secret_key: String,
    pub app_name: Option<String>,
    pub app_key: Option<String>,
    pub ssl: bool,
    /// Disables peer-certificate verification on the TLS connection. A hard
    /// protocol requirement of the config service, not a recommendation --
    /// must be set explicitly, never defaulted to `true` (spec §9).
    pub insecure_skip_verify: bool,
    pub request_timeout: Duration,
    pub refresh_interval: Duration,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    endpoint: Option<String>,
    namespace: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    app_name: Option<String>,
    app_key: Option<String>,
    ssl: Option<bool>,
    insecure_skip_verify: Option<bool>,
    request_timeout: Option<Duration>,
    refresh_interval: Option<Duration>,
    cache_dir: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn access_key(mut self, access_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self
    }

    pub fn secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = Some(app_key.into());
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = Some(ssl);
        self
    }

    pub fn insecure_skip_verify(mut self, insecure_skip_verify: bool) -> Self {
        self.insecure_skip_verify = Some(insecure_skip_verify);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    fn required(field: &'static str, value: Option<String>) -> Result<String, DiamondError> {
        match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(DiamondError::InvalidConfig {
                field,
                reason: "required but missing".to_string(),
            }),
        }
    }

    pub fn build(self) -> Result<Config, DiamondError> {
        let endpoint = Self::required("endpoint", self.endpoint)?;
        let namespace = Self::required("namespace", self.namespace)?;
        let access_key = Self::required("accessKey", self.access_key)?;
        let secret_key = Self::required("secretKey", self.secret_key)?;

        let cache_dir = self.cache_dir.unwrap_or_else(default_cache_dir);

        Ok(Config {
            endpoint,
            namespace,
            access_key,
            secret_key,
            app_name: self.app_name,
            app_key: self.app_key,
            ssl: self.ssl.unwrap_or(true),
            insecure_skip_verify: self.insecure_skip_verify.unwrap_or(false),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            refresh_interval: self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
            cache_dir,
        })
    }
}

fn default_cache_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(DEFAULT_CACHE_DIR_NAME)
}
