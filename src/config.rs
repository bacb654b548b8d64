//! Resource engine configuration, loaded from environment variables.

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Seconds between check scheduler sweeps.
    pub scan_interval_secs: u64,
    /// Default check interval for resources that do not set `check_every`.
    pub default_check_interval_secs: u64,
    /// Seconds between tracker sweeps when no build notification arrives.
    pub tracker_fallback_secs: u64,
    /// Maximum database pool size.
    pub max_pool_size: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let scan_interval_secs = std::env::var("ENGINE_SCAN_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let default_check_interval_secs = std::env::var("ENGINE_DEFAULT_CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        let tracker_fallback_secs = std::env::var("ENGINE_TRACKER_FALLBACK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let max_pool_size = std::env::var("ENGINE_MAX_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Self {
            scan_interval_secs,
            default_check_interval_secs,
            tracker_fallback_secs,
            max_pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = EngineConfig::from_env();
        assert_eq!(config.scan_interval_secs, 10);
        assert_eq!(config.default_check_interval_secs, 60);
        assert_eq!(config.max_pool_size, 10);
    }
}
