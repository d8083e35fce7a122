use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::bucket::{BucketingVersion, SaltMode};

/// Default lifetime of a cached snapshot before it counts as stale.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
/// Default upper bound on a forced synchronous refresh.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings of an [crate::Engine].
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// How long a snapshot is used before the engine wants a fresh one.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_ttl: Duration,
    /// Longest an evaluation waits for the provider when no snapshot was ever loaded.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub refresh_timeout: Duration,
    pub salt_mode: SaltMode,
    pub bucketing_version: BucketingVersion,
    /// Actor recorded on audit events when the caller does not name one.
    pub default_actor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            salt_mode: SaltMode::default(),
            bucketing_version: BucketingVersion::default(),
            default_actor: "system".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_salt_mode(mut self, salt_mode: SaltMode) -> Self {
        self.salt_mode = salt_mode;
        self
    }
}
