use serde::{Deserialize, Serialize};

/// Mount-time configuration. Mirrors the daemon's JSON config file; missing
/// fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Database contact points, comma separated ("host:port,host:port").
    pub server: String,
    pub keyspace: String,
    #[serde(alias = "owner")]
    pub owner_id: i32,
    pub environment: String,
    /// Consistency level applied to every statement (one, quorum, all, ...).
    #[serde(alias = "consistency_level")]
    pub consistency: String,
    /// TTL handed to the kernel for entry/attribute replies.
    #[serde(alias = "entry_ttl")]
    pub entry_ttl_secs: f64,
    #[serde(alias = "negative_ttl")]
    pub negative_ttl_secs: f64,
    /// Time-to-freshness of the metadata cache. Zero disables it.
    #[serde(alias = "fcache_ttl")]
    pub fcache_ttl_secs: u64,
    /// Read-through body cache toggle and byte budget.
    pub cache_enabled: bool,
    pub cache_size_bytes: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9042".to_string(),
            keyspace: "colfs".to_string(),
            owner_id: 1,
            environment: "production".to_string(),
            consistency: "one".to_string(),
            entry_ttl_secs: 1.0,
            negative_ttl_secs: 1.0,
            fcache_ttl_secs: 60,
            cache_enabled: false,
            cache_size_bytes: 64 << 20,
        }
    }
}

impl MountConfig {
    /// Name of the process-wide body cache group for this mount's scope.
    pub fn cache_group(&self) -> String {
        format!("{}:{}", self.owner_id, self.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.owner_id, 1);
        assert_eq!(config.fcache_ttl_secs, 60);
        assert!(!config.cache_enabled);
    }

    #[test]
    fn test_config_aliases_and_partial_file() {
        let config: MountConfig = serde_json::from_str(
            "{\"server\":\"db1:9042,db2:9042\",\"owner\":7,\"entry_ttl\":0.5,\"fcache_ttl\":5}",
        )
        .unwrap();
        assert_eq!(config.server, "db1:9042,db2:9042");
        assert_eq!(config.owner_id, 7);
        assert_eq!(config.entry_ttl_secs, 0.5);
        assert_eq!(config.fcache_ttl_secs, 5);
        assert_eq!(config.keyspace, "colfs");
    }

    #[test]
    fn test_cache_group_name() {
        let config = MountConfig {
            owner_id: 3,
            environment: "staging".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cache_group(), "3:staging");
    }
}
