// ABOUTME: Incremental pod specification assembly for one build sandbox
// ABOUTME: Stages placeholder containers so activation happens later via image patch

use crate::config::{HostVolume, KubeBackendConfig};
use crate::template::PodTemplate;
use convoy_engine::{Build, Container, EngineError, PullPolicy, Result};
use k8s_openapi::api::core::v1::{
    Capabilities, Container as PodContainer, EnvVar, HostPathVolumeSource, Pod, PodDNSConfig,
    PodSecurityContext, PodSpec, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::debug;

/// Neutral idle image staged for every container. Real images are injected
/// later with a targeted patch, which turns the backend's start-everything
/// model into an effectively blocked state until activation.
pub const PLACEHOLDER_IMAGE: &str = "registry.k8s.io/pause:3.9";

/// Label carrying the build identifier, also the watch selector key
pub const BUILD_LABEL: &str = "convoy.dev/build";

/// Single-owner accumulation of one build's pod specification. Mutated only
/// by the sequential engine call path; after the one creation call, only a
/// container's image field may still change (via patch, never through here).
pub struct PodAssembler {
    build_id: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    containers: Vec<PodContainer>,
    /// Identity lookup table: sandbox index -> container name
    names: Vec<String>,
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
    node_selector: BTreeMap<String, String>,
    tolerations: Vec<Toleration>,
    security_context: Option<PodSecurityContext>,
    dns_config: Option<PodDNSConfig>,
    cap_add: Vec<String>,
    cap_drop: Vec<String>,
    privileged_images: Vec<String>,
}

impl PodAssembler {
    pub fn new(build_id: &str, config: &KubeBackendConfig) -> Result<Self> {
        let mut labels = BTreeMap::new();
        labels.insert(BUILD_LABEL.to_string(), build_id.to_string());

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (i, raw) in config.host_volumes.iter().enumerate() {
            let parsed = HostVolume::parse(raw)?;
            let name = format!("convoy-hostvol-{}", i);
            volumes.push(Volume {
                name: name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: parsed.host_path,
                    type_: None,
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name,
                mount_path: parsed.container_path,
                read_only: Some(parsed.readonly),
                ..Default::default()
            });
        }

        Ok(Self {
            build_id: build_id.to_string(),
            namespace: config.namespace.clone(),
            labels,
            annotations: BTreeMap::new(),
            containers: Vec::new(),
            names: Vec::new(),
            volumes,
            mounts,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            security_context: None,
            dns_config: None,
            cap_add: Vec::new(),
            cap_drop: config.cap_drop.clone(),
            privileged_images: config.privileged_images.clone(),
        })
    }

    /// Merge template defaults field-by-field. Keys already set by the agent
    /// are never overwritten; the build identity label always wins.
    pub fn apply_template(&mut self, template: &PodTemplate) {
        for (key, value) in &template.labels {
            self.labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (key, value) in &template.annotations {
            self.annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if self.node_selector.is_empty() {
            self.node_selector = template.node_selector.clone();
        }
        if self.tolerations.is_empty() {
            self.tolerations = template.tolerations.clone();
        }
        if self.security_context.is_none() {
            self.security_context = template.security_context.clone();
        }
        if self.dns_config.is_none() {
            self.dns_config = template.dns_config.clone();
        }
        if self.cap_add.is_empty() {
            self.cap_add = template.capability_add.clone();
        }
    }

    /// Append one placeholder entry for a pipeline container. The reserved
    /// init phase has no sandbox index and is skipped. Appending out of
    /// ordinal order is an identity error, never corrected silently.
    pub fn stage_container(&mut self, container: &Container) -> Result<()> {
        let Some(index) = container.sandbox_index() else {
            debug!(
                "skipping reserved init phase {} for build {}",
                container.id, self.build_id
            );
            return Ok(());
        };

        if index != self.containers.len() {
            return Err(EngineError::IdentityMismatch {
                expected: format!("next sandbox index {}", self.containers.len()),
                found: format!("{} (ordinal {})", container.id, container.ordinal),
            });
        }

        let privileged = image_allowed(&self.privileged_images, &container.image);
        let entry = PodContainer {
            name: container.id.clone(),
            image: Some(PLACEHOLDER_IMAGE.to_string()),
            image_pull_policy: Some(staged_pull_policy(container.pull).to_string()),
            command: non_empty(&container.entrypoint),
            args: non_empty(&container.command),
            working_dir: container.working_dir.clone(),
            volume_mounts: if self.mounts.is_empty() {
                None
            } else {
                Some(self.mounts.clone())
            },
            security_context: self.container_security_context(privileged),
            ..Default::default()
        };

        debug!(
            "staged container {} at sandbox index {} for build {}",
            container.id, index, self.build_id
        );
        self.containers.push(entry);
        self.names.push(container.id.clone());
        Ok(())
    }

    /// Fill each staged container's environment from the model. Called
    /// immediately before the creation call so later-staged containers cannot
    /// leave stale values behind.
    pub fn finalize_environment(&mut self, build: &Build) -> Result<()> {
        for container in build.all_containers() {
            let Some(index) = container.sandbox_index() else {
                continue;
            };
            let staged = self.containers.get_mut(index).ok_or_else(|| {
                EngineError::IdentityMismatch {
                    expected: format!("a staged container at index {}", index),
                    found: format!("{} (ordinal {})", container.id, container.ordinal),
                }
            })?;
            if staged.name != container.id {
                return Err(EngineError::IdentityMismatch {
                    expected: staged.name.clone(),
                    found: container.id.clone(),
                });
            }

            let mut env: Vec<EnvVar> = container
                .environment
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    value_from: None,
                })
                .collect();
            env.sort_by(|a, b| a.name.cmp(&b.name));
            staged.env = if env.is_empty() { None } else { Some(env) };
        }
        Ok(())
    }

    /// Identity lookup table entry for a sandbox index
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// All staged container names in index order
    pub fn container_names(&self) -> Vec<String> {
        self.names.clone()
    }

    /// Render the pod object for the single atomic creation call
    pub fn build_pod(&self) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(self.build_id.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: if self.annotations.is_empty() {
                    None
                } else {
                    Some(self.annotations.clone())
                },
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: self.containers.clone(),
                restart_policy: Some("Never".to_string()),
                volumes: if self.volumes.is_empty() {
                    None
                } else {
                    Some(self.volumes.clone())
                },
                node_selector: if self.node_selector.is_empty() {
                    None
                } else {
                    Some(self.node_selector.clone())
                },
                tolerations: if self.tolerations.is_empty() {
                    None
                } else {
                    Some(self.tolerations.clone())
                },
                security_context: self.security_context.clone(),
                dns_config: self.dns_config.clone(),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn container_security_context(&self, privileged: bool) -> Option<SecurityContext> {
        let capabilities = if self.cap_add.is_empty() && self.cap_drop.is_empty() {
            None
        } else {
            Some(Capabilities {
                add: non_empty(&self.cap_add),
                drop: non_empty(&self.cap_drop),
            })
        };
        if !privileged && capabilities.is_none() {
            return None;
        }
        Some(SecurityContext {
            privileged: Some(privileged),
            capabilities,
            ..Default::default()
        })
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// Image pull policy for a staged placeholder. Containers are staged
/// conservatively; `Always` is passed through so a patched image is still
/// re-pulled, and `Never` is honored verbatim.
fn staged_pull_policy(policy: PullPolicy) -> &'static str {
    match policy {
        PullPolicy::Always => "Always",
        PullPolicy::Never => "Never",
        PullPolicy::IfNotPresent | PullPolicy::OnStart => "IfNotPresent",
    }
}

/// Canonical `name:tag` form of an image reference: digest stripped, default
/// tag `latest`. Privileged mode is matched against this form, never the raw
/// string.
pub fn canonical_image(image: &str) -> String {
    let image = image.split('@').next().unwrap_or(image);
    let slash = image.rfind('/');
    match image.rfind(':') {
        Some(colon) if slash.map_or(true, |s| colon > s) => {
            format!("{}:{}", &image[..colon], &image[colon + 1..])
        }
        _ => format!("{}:latest", image),
    }
}

/// Glob-style match supporting `*` as "any sequence"
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    fn matches(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => matches(&p[1..], v) || (!v.is_empty() && matches(p, &v[1..])),
            Some(c) => v.first() == Some(c) && matches(&p[1..], &v[1..]),
        }
    }
    matches(pattern.as_bytes(), value.as_bytes())
}

fn image_allowed(patterns: &[String], image: &str) -> bool {
    let canonical = canonical_image(image);
    patterns
        .iter()
        .any(|pattern| pattern_matches(pattern, &canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_engine::Stage;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn single_stage(containers: Vec<Container>) -> Vec<Stage> {
        vec![Stage {
            name: "default".to_string(),
            containers,
        }]
    }

    fn step(id: &str, ordinal: u32) -> Container {
        Container {
            id: id.to_string(),
            ordinal,
            image: "alpine:3.20".to_string(),
            entrypoint: vec![],
            command: vec![],
            environment: HashMap::new(),
            pull: PullPolicy::default(),
            detached: false,
            working_dir: None,
        }
    }

    fn assembler() -> PodAssembler {
        PodAssembler::new("b1", &KubeBackendConfig::default()).unwrap()
    }

    #[test]
    fn test_staging_preserves_ordinal_index_mapping() {
        let mut assembler = assembler();
        assembler.stage_container(&step("init", 1)).unwrap();
        assembler.stage_container(&step("clone", 2)).unwrap();
        assembler.stage_container(&step("build", 3)).unwrap();
        assembler.stage_container(&step("deploy", 4)).unwrap();

        // The identity table agrees with ordinal - 2 after every staging call
        assert_eq!(assembler.name_at(0), Some("clone"));
        assert_eq!(assembler.name_at(1), Some("build"));
        assert_eq!(assembler.name_at(2), Some("deploy"));
        assert_eq!(assembler.name_at(3), None);
        assert_eq!(
            assembler.container_names(),
            vec!["clone", "build", "deploy"]
        );
    }

    #[test]
    fn test_out_of_order_staging_is_identity_error() {
        let mut assembler = assembler();
        assembler.stage_container(&step("clone", 2)).unwrap();

        // Ordinal 4 would land at index 2 while index 1 is still unstaged
        let err = assembler.stage_container(&step("deploy", 4)).unwrap_err();
        assert!(matches!(err, EngineError::IdentityMismatch { .. }));
        // The table is untouched by the failed call
        assert_eq!(assembler.container_names(), vec!["clone"]);
    }

    #[test]
    fn test_staged_containers_use_placeholder_image() {
        let mut assembler = assembler();
        let mut clone = step("clone", 2);
        clone.image = "docker.io/library/golang:1.22".to_string();
        clone.entrypoint = vec!["/bin/sh".to_string()];
        clone.command = vec!["-c".to_string(), "go build".to_string()];
        assembler.stage_container(&clone).unwrap();

        let pod = assembler.build_pod();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].image.as_deref(), Some(PLACEHOLDER_IMAGE));
        assert_eq!(
            spec.containers[0].image_pull_policy.as_deref(),
            Some("IfNotPresent")
        );
        assert_eq!(
            spec.containers[0].command,
            Some(vec!["/bin/sh".to_string()])
        );
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.metadata.labels.unwrap().get(BUILD_LABEL),
            Some(&"b1".to_string())
        );
    }

    #[test]
    fn test_environment_filled_only_at_finalize() {
        let mut assembler = assembler();
        let mut clone = step("clone", 2);
        clone
            .environment
            .insert("GIT_REF".to_string(), "main".to_string());
        clone
            .environment
            .insert("CI".to_string(), "true".to_string());
        assembler.stage_container(&clone).unwrap();

        // Nothing before finalize
        assert_eq!(assembler.build_pod().spec.unwrap().containers[0].env, None);

        let build = Build {
            id: "b1".to_string(),
            stages: single_stage(vec![clone]),
            services: vec![],
        };
        assembler.finalize_environment(&build).unwrap();

        let env = assembler.build_pod().spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        // Sorted by name for a deterministic spec
        assert_eq!(env[0].name, "CI");
        assert_eq!(env[0].value.as_deref(), Some("true"));
        assert_eq!(env[1].name, "GIT_REF");
        assert_eq!(env[1].value.as_deref(), Some("main"));
    }

    #[test]
    fn test_finalize_rejects_identity_mismatch() {
        let mut assembler = assembler();
        assembler.stage_container(&step("clone", 2)).unwrap();

        // Same ordinal, different identity: must fail, never silently remap
        let impostor = step("imposter", 2);
        let build = Build {
            id: "b1".to_string(),
            stages: single_stage(vec![impostor]),
            services: vec![],
        };
        let err = assembler.finalize_environment(&build).unwrap_err();
        assert!(matches!(err, EngineError::IdentityMismatch { .. }));
    }

    #[test]
    fn test_privileged_granted_by_canonical_allowlist_only() {
        let config = KubeBackendConfig {
            privileged_images: vec!["docker.io/library/docker:*".to_string()],
            ..Default::default()
        };
        let mut assembler = PodAssembler::new("b1", &config).unwrap();

        let mut dind = step("dind", 2);
        dind.image = "docker.io/library/docker:27-dind".to_string();
        let mut plain = step("plain", 3);
        plain.image = "docker.io/library/alpine:3.20".to_string();
        assembler.stage_container(&dind).unwrap();
        assembler.stage_container(&plain).unwrap();

        let spec = assembler.build_pod().spec.unwrap();
        let privileged = |i: usize| {
            spec.containers[i]
                .security_context
                .as_ref()
                .and_then(|sc| sc.privileged)
        };
        assert_eq!(privileged(0), Some(true));
        assert_eq!(privileged(1), None);
    }

    #[test]
    fn test_host_volumes_mounted_in_every_container() {
        let config = KubeBackendConfig {
            host_volumes: vec!["/var/cache:/cache".to_string(), "/certs:/certs:ro".to_string()],
            ..Default::default()
        };
        let mut assembler = PodAssembler::new("b1", &config).unwrap();
        assembler.stage_container(&step("clone", 2)).unwrap();
        assembler.stage_container(&step("build", 3)).unwrap();

        let spec = assembler.build_pod().spec.unwrap();
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts.len(), 2);
            assert_eq!(mounts[1].read_only, Some(true));
        }
    }

    #[test]
    fn test_cap_drop_applied_to_all_containers() {
        let config = KubeBackendConfig {
            cap_drop: vec!["ALL".to_string()],
            ..Default::default()
        };
        let mut assembler = PodAssembler::new("b1", &config).unwrap();
        assembler.stage_container(&step("clone", 2)).unwrap();

        let spec = assembler.build_pod().spec.unwrap();
        let caps = spec.containers[0]
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .clone()
            .unwrap();
        assert_eq!(caps.drop, Some(vec!["ALL".to_string()]));
    }

    #[test]
    fn test_template_merge_never_overrides_identity_label() {
        let mut assembler = assembler();
        let template = PodTemplate::from_yaml(
            r#"
labels:
  convoy.dev/build: hijacked
  team: ci
nodeSelector:
  pool: builds
"#,
        )
        .unwrap();
        assembler.apply_template(&template);

        let pod = assembler.build_pod();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(BUILD_LABEL), Some(&"b1".to_string()));
        assert_eq!(labels.get("team"), Some(&"ci".to_string()));
        assert_eq!(
            pod.spec.unwrap().node_selector.unwrap().get("pool"),
            Some(&"builds".to_string())
        );
    }

    #[test]
    fn test_canonical_image() {
        assert_eq!(canonical_image("golang"), "golang:latest");
        assert_eq!(canonical_image("golang:1.22"), "golang:1.22");
        assert_eq!(
            canonical_image("registry:5000/repo/app"),
            "registry:5000/repo/app:latest"
        );
        assert_eq!(
            canonical_image("alpine:3.20@sha256:deadbeef"),
            "alpine:3.20"
        );
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("docker.io/library/docker:*", "docker.io/library/docker:27-dind"));
        assert!(pattern_matches("*:latest", "anything:latest"));
        assert!(pattern_matches("alpine:3.20", "alpine:3.20"));
        assert!(!pattern_matches("alpine:3.20", "alpine:3.21"));
        assert!(!pattern_matches("docker:*", "docker.io/library/docker:27"));
    }
}
