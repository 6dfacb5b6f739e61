//! Runtime configuration for the controller

use std::time::Duration;

use crate::identity::KNOWN_REGIONS;
use crate::{
    Error, Result, CACHE_SYNC_ATTEMPTS, DEFAULT_DEBOUNCE_MILLIS, DEFAULT_REQUESTS_PER_SECOND,
    DEFAULT_RESYNC_INTERVAL_SECS,
};

/// Configuration for one controller instance
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Cloud region of the cluster (e.g., "ap-guangzhou")
    pub region: String,
    /// TKE cluster id (e.g., "cls-abc123")
    pub cluster_id: Option<String>,
    /// TKE cluster name, looked up when no id is given
    pub cluster_name: Option<String>,
    /// Namespace to watch for binding ConfigMaps; all namespaces when unset
    pub namespace: Option<String>,
    /// Interval between forced convergence passes
    pub resync_interval: Duration,
    /// Quiet period after the last change before a pass runs
    pub debounce: Duration,
    /// Request rate against the identity service, per worker
    pub requests_per_second: u32,
    /// Attempts at waiting for the ConfigMap cache before giving up
    pub cache_sync_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            cluster_id: None,
            cluster_name: None,
            namespace: None,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MILLIS),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            cache_sync_attempts: CACHE_SYNC_ATTEMPTS,
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::validation("region is required"));
        }
        if !KNOWN_REGIONS.contains(&self.region.as_str()) {
            return Err(Error::validation(format!("unknown region {}", self.region)));
        }
        let has_id = self.cluster_id.as_deref().is_some_and(|s| !s.is_empty());
        let has_name = self.cluster_name.as_deref().is_some_and(|s| !s.is_empty());
        if !has_id && !has_name {
            return Err(Error::validation(
                "either a cluster id or a cluster name is required",
            ));
        }
        if self.requests_per_second == 0 {
            return Err(Error::validation("requests per second must be positive"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::validation("resync interval must be positive"));
        }
        if self.debounce.is_zero() {
            return Err(Error::validation("debounce window must be positive"));
        }
        if self.cache_sync_attempts == 0 {
            return Err(Error::validation("cache sync attempts must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> ControllerConfig {
        ControllerConfig {
            region: "ap-guangzhou".to_string(),
            cluster_id: Some("cls-abc123".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_with_region_and_cluster_are_valid() {
        let config = valid();
        config.validate().expect("valid");
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.debounce, Duration::from_secs(1));
        assert_eq!(config.requests_per_second, 5);
    }

    #[test]
    fn test_cluster_name_alone_is_enough() {
        let config = ControllerConfig {
            cluster_id: None,
            cluster_name: Some("prod".to_string()),
            ..valid()
        };
        config.validate().expect("valid");
    }

    #[rstest]
    #[case::no_region(ControllerConfig { region: String::new(), ..valid() }, "region is required")]
    #[case::bad_region(ControllerConfig { region: "mars-1".to_string(), ..valid() }, "unknown region")]
    #[case::no_cluster(ControllerConfig { cluster_id: None, ..valid() }, "cluster id or a cluster name")]
    #[case::empty_cluster(ControllerConfig { cluster_id: Some(String::new()), ..valid() }, "cluster id or a cluster name")]
    #[case::zero_rate(ControllerConfig { requests_per_second: 0, ..valid() }, "requests per second")]
    #[case::zero_resync(ControllerConfig { resync_interval: Duration::ZERO, ..valid() }, "resync interval")]
    #[case::zero_debounce(ControllerConfig { debounce: Duration::ZERO, ..valid() }, "debounce window")]
    #[case::zero_attempts(ControllerConfig { cache_sync_attempts: 0, ..valid() }, "cache sync attempts")]
    fn test_invalid_config_is_fatal(#[case] config: ControllerConfig, #[case] expected: &str) {
        let err = config.validate().err().expect("should be invalid");
        assert!(err.is_fatal());
        assert!(err.to_string().contains(expected), "got {err}");
    }
}
