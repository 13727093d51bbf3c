use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_BACKOFF_MS: u64 = 8_000;
/// Slowest blob transfer rate tolerated before a download times out.
const MIN_BLOB_BYTES_PER_SEC: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Registry client settings, the `[registry]` table of `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Hosts reached over plain HTTP, with or without a port.
    pub insecure: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, Credentials>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 500,
            insecure: Vec::new(),
            credentials: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn with_credentials(mut self, registry: &str, username: &str, password: &str) -> Self {
        self.credentials.insert(
            registry.to_owned(),
            Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            },
        );
        self
    }

    pub fn credentials_for(&self, registry: &str) -> Option<&Credentials> {
        self.credentials.get(registry)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Time allowed to receive a blob body of `size` bytes: the request
    /// timeout plus the time the blob takes at the slowest tolerated rate.
    pub fn blob_timeout(&self, size: u64) -> Duration {
        self.timeout() + Duration::from_secs(size / MIN_BLOB_BYTES_PER_SEC)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }

    pub fn uses_plain_http(&self, host: &str) -> bool {
        let hostname = host.rsplit_once(':').map_or(host, |(name, _)| name);
        matches!(hostname, "localhost" | "127.0.0.1")
            || self
                .insecure
                .iter()
                .any(|entry| entry == host || entry == hostname)
    }
}
