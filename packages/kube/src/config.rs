// ABOUTME: Backend configuration for the Kubernetes sandbox engine
// ABOUTME: Namespace, template source, privileged allow-list, volumes, and log tuning

use crate::logs::{Backoff, DEFAULT_MAX_LOG_BYTES};
use convoy_engine::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where pod-level template defaults come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    /// Fetched once per build from a ConfigMap in the sandbox namespace
    ConfigMap(String),
    /// Loaded once at engine construction from a local YAML file
    File(PathBuf),
}

/// Retry tuning for the per-container log streamer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 2.0,
            max_ms: 15_000,
            retries: 8,
        }
    }
}

impl BackoffConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.base_ms),
            factor: self.factor,
            max: Duration::from_millis(self.max_ms),
            retries: self.retries,
        }
    }
}

/// Configuration accepted by the Kubernetes backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeBackendConfig {
    /// Namespace hosting all build sandboxes
    pub namespace: String,
    /// Optional pod-level defaults merged into every sandbox
    pub template: Option<TemplateSource>,
    /// Canonical image patterns (name:tag, `*` wildcards) granted privileged mode
    pub privileged_images: Vec<String>,
    /// Host paths mounted into every sandbox container, `host:container[:ro]`
    pub host_volumes: Vec<String>,
    /// Linux capabilities dropped from every sandbox container
    pub cap_drop: Vec<String>,
    /// Hard cap on captured log bytes per container
    pub max_log_bytes: usize,
    pub log_backoff: BackoffConfig,
}

impl Default for KubeBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            template: None,
            privileged_images: Vec::new(),
            host_volumes: Vec::new(),
            cap_drop: Vec::new(),
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            log_backoff: BackoffConfig::default(),
        }
    }
}

impl KubeBackendConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("failed to parse backend config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the backend cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(EngineError::Config("namespace must not be empty".to_string()));
        }
        if self.max_log_bytes == 0 {
            return Err(EngineError::Config(
                "max_log_bytes must be greater than zero".to_string(),
            ));
        }
        for volume in &self.host_volumes {
            HostVolume::parse(volume)?;
        }
        Ok(())
    }
}

/// A parsed `host:container[:ro]` mount entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostVolume {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

impl HostVolume {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let (host_path, container_path, readonly) = match parts.as_slice() {
            [host, container] => (*host, *container, false),
            [host, container, "ro"] => (*host, *container, true),
            [host, container, "rw"] => (*host, *container, false),
            _ => {
                return Err(EngineError::Config(format!(
                    "invalid host volume {:?}, expected host:container[:ro]",
                    raw
                )))
            }
        };
        if host_path.is_empty() || container_path.is_empty() {
            return Err(EngineError::Config(format!(
                "invalid host volume {:?}, paths must not be empty",
                raw
            )));
        }
        Ok(Self {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
            readonly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = KubeBackendConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, "default");
        assert_eq!(config.max_log_bytes, DEFAULT_MAX_LOG_BYTES);
    }

    #[test]
    fn test_host_volume_parsing() {
        let vol = HostVolume::parse("/var/cache:/cache").unwrap();
        assert_eq!(vol.host_path, "/var/cache");
        assert_eq!(vol.container_path, "/cache");
        assert!(!vol.readonly);

        let vol = HostVolume::parse("/etc/certs:/certs:ro").unwrap();
        assert!(vol.readonly);

        assert!(HostVolume::parse("/only-host").is_err());
        assert!(HostVolume::parse(":/missing-host").is_err());
        assert!(HostVolume::parse("/a:/b:bogus").is_err());
    }

    #[test]
    fn test_invalid_host_volume_is_fatal_config_error() {
        let config = KubeBackendConfig {
            host_volumes: vec!["broken".to_string()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_file_parses_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "namespace: builds\nprivileged_images:\n  - \"docker.io/library/docker:*\"\nmax_log_bytes: 1024\nlog_backoff:\n  base_ms: 100\n  retries: 3\n"
        )
        .unwrap();

        let config = KubeBackendConfig::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, "builds");
        assert_eq!(config.privileged_images, vec!["docker.io/library/docker:*"]);
        assert_eq!(config.max_log_bytes, 1024);
        assert_eq!(config.log_backoff.base_ms, 100);
        assert_eq!(config.log_backoff.retries, 3);
        // Unset fields keep their defaults
        assert_eq!(config.log_backoff.factor, 2.0);
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let config = KubeBackendConfig {
            namespace: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            EngineError::Config(_)
        ));
    }
}
