// ABOUTME: Pod-level template defaults merged into every build sandbox
// ABOUTME: Loaded from a ConfigMap per build or a static fallback file at startup

use convoy_engine::{EngineError, Result};
use k8s_openapi::api::core::v1::{ConfigMap, PodDNSConfig, PodSecurityContext, Toleration};
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// ConfigMap data key holding the template document
pub const TEMPLATE_KEY: &str = "template";

/// Operator-supplied pod defaults. Merged field-by-field into the sandbox
/// specification; anything the agent already set wins, the build identity
/// label in particular is never replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodTemplate {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub security_context: Option<PodSecurityContext>,
    pub dns_config: Option<PodDNSConfig>,
    /// Linux capabilities added to every sandbox container
    pub capability_add: Vec<String>,
}

impl PodTemplate {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| EngineError::Template(format!("failed to parse pod template: {}", e)))
    }

    /// Read the static fallback template file. Called once at engine
    /// construction, never per build.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Template(format!(
                "failed to read pod template {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!("loaded fallback pod template from {}", path.display());
        Self::from_yaml(&raw)
    }

    /// Fetch the template ConfigMap referenced by the backend configuration.
    /// A missing map or missing data key is fatal for the build.
    pub async fn from_config_map(client: Client, namespace: &str, name: &str) -> Result<Self> {
        let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);
        let config_map = config_maps.get(name).await.map_err(|e| {
            EngineError::Template(format!("failed to fetch template config map {}: {}", name, e))
        })?;

        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(TEMPLATE_KEY))
            .ok_or_else(|| {
                EngineError::Template(format!(
                    "config map {} has no {:?} key",
                    name, TEMPLATE_KEY
                ))
            })?;
        debug!("loaded pod template from config map {}", name);
        Self::from_yaml(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_template() {
        let template = PodTemplate::from_yaml(
            r#"
labels:
  team: ci
annotations:
  sidecar.istio.io/inject: "false"
nodeSelector:
  kubernetes.io/arch: amd64
tolerations:
  - key: ci-only
    operator: Exists
    effect: NoSchedule
securityContext:
  runAsUser: 1000
dnsConfig:
  nameservers:
    - 10.0.0.2
capabilityAdd:
  - NET_ADMIN
"#,
        )
        .unwrap();

        assert_eq!(template.labels.get("team"), Some(&"ci".to_string()));
        assert_eq!(
            template.node_selector.get("kubernetes.io/arch"),
            Some(&"amd64".to_string())
        );
        assert_eq!(template.tolerations.len(), 1);
        assert_eq!(
            template.security_context.as_ref().unwrap().run_as_user,
            Some(1000)
        );
        assert_eq!(
            template.dns_config.unwrap().nameservers,
            Some(vec!["10.0.0.2".to_string()])
        );
        assert_eq!(template.capability_add, vec!["NET_ADMIN"]);
    }

    #[test]
    fn test_empty_template_is_valid() {
        let template = PodTemplate::from_yaml("{}").unwrap();
        assert!(template.labels.is_empty());
        assert!(template.security_context.is_none());
    }

    #[test]
    fn test_garbage_template_is_fatal() {
        let err = PodTemplate::from_yaml("labels: [not, a, map]").unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "labels:\n  pool: spot").unwrap();

        let template = PodTemplate::from_file(file.path()).unwrap();
        assert_eq!(template.labels.get("pool"), Some(&"spot".to_string()));

        assert!(matches!(
            PodTemplate::from_file("/nonexistent/template.yaml").unwrap_err(),
            EngineError::Template(_)
        ));
    }
}
