// ABOUTME: Engine trait implementation backed by one Kubernetes pod per build
// ABOUTME: Drives assembly, gate handshakes, image-patch activation, and teardown

use crate::assembler::PodAssembler;
use crate::config::{KubeBackendConfig, TemplateSource};
use crate::logs::stream_container_logs;
use crate::template::PodTemplate;
use crate::tracker::BuildTracker;
use async_trait::async_trait;
use convoy_engine::{
    Build, Container, ContainerState, Engine, EngineError, LogTail, Result,
};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One live build sandbox: the spec under construction, its tracker, and the
/// created-flag used to keep teardown idempotent
struct BuildSandbox {
    assembler: Mutex<PodAssembler>,
    tracker: Arc<BuildTracker>,
    created: AtomicBool,
}

/// Kubernetes implementation of the runtime engine contract. Each build maps
/// to exactly one pod named after the build identifier.
pub struct KubeEngine {
    client: Client,
    config: KubeBackendConfig,
    /// Static fallback template, read once at construction
    fallback_template: Option<PodTemplate>,
    builds: RwLock<HashMap<String, Arc<BuildSandbox>>>,
}

impl KubeEngine {
    /// Connect using the ambient kubeconfig/in-cluster environment
    pub async fn connect(config: KubeBackendConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EngineError::Config(format!("failed to build kube client: {}", e)))?;
        Self::with_client(client, config)
    }

    /// Create with a specific client (used by tests and embedders)
    pub fn with_client(client: Client, config: KubeBackendConfig) -> Result<Self> {
        config.validate()?;
        let fallback_template = match &config.template {
            Some(TemplateSource::File(path)) => Some(PodTemplate::from_file(path)?),
            _ => None,
        };
        Ok(Self {
            client,
            config,
            fallback_template,
            builds: RwLock::new(HashMap::new()),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn sandbox(&self, build_id: &str) -> Result<Arc<BuildSandbox>> {
        self.builds
            .read()
            .await
            .get(build_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBuild(build_id.to_string()))
    }

    /// Resolve template defaults for one build. A referenced ConfigMap is
    /// required: failing to fetch it is fatal for the build.
    async fn resolve_template(&self) -> Result<Option<PodTemplate>> {
        match &self.config.template {
            Some(TemplateSource::ConfigMap(name)) => Ok(Some(
                PodTemplate::from_config_map(self.client.clone(), &self.config.namespace, name)
                    .await?,
            )),
            Some(TemplateSource::File(_)) => Ok(self.fallback_template.clone()),
            None => Ok(None),
        }
    }

    /// Verify the ordinal/index mapping against the identity table before any
    /// targeted mutation
    async fn checked_index(&self, sandbox: &BuildSandbox, container: &Container) -> Result<usize> {
        let index = container.sandbox_index().ok_or_else(|| {
            EngineError::Config(format!(
                "container {} holds the reserved init ordinal and cannot be addressed",
                container.id
            ))
        })?;
        let assembler = sandbox.assembler.lock().await;
        match assembler.name_at(index) {
            Some(name) if name == container.id => Ok(index),
            Some(name) => Err(EngineError::IdentityMismatch {
                expected: name.to_string(),
                found: container.id.clone(),
            }),
            None => Err(EngineError::UnknownContainer(container.id.clone())),
        }
    }

    fn spawn_log_streamers(&self, build_id: &str, sandbox: &Arc<BuildSandbox>, names: Vec<String>) {
        for name in names {
            let tracker = sandbox.tracker.clone();
            let pods = self.pods();
            let pod_name = build_id.to_string();
            let backoff = self.config.log_backoff.backoff();
            tokio::spawn(async move {
                let sink = match tracker.sink(&name).await {
                    Ok(sink) => sink,
                    Err(e) => {
                        warn!("no log sink for container {}: {}", name, e);
                        return;
                    }
                };
                let container = name.clone();
                stream_container_logs(&name, &sink, &backoff, move || {
                    let pods = pods.clone();
                    let pod_name = pod_name.clone();
                    let container = container.clone();
                    async move {
                        let params = LogParams {
                            container: Some(container),
                            follow: true,
                            ..Default::default()
                        };
                        pods.log_stream(&pod_name, &params)
                            .await
                            .map(|s| Box::pin(s).compat())
                            .map_err(|e| e.to_string())
                    }
                })
                .await;
            });
        }
    }
}

/// Strategic-merge patch body that sets exactly one named container's image.
/// Strategic merge keys pod containers by name, so siblings are untouched.
pub fn image_patch(container: &Container) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "containers": [{
                "name": container.id,
                "image": container.image,
            }]
        }
    })
}

#[async_trait]
impl Engine for KubeEngine {
    async fn setup_build(&self, build: &Build) -> Result<()> {
        self.config.validate()?;
        let template = self.resolve_template().await?;

        let mut assembler = PodAssembler::new(&build.id, &self.config)?;
        if let Some(template) = &template {
            assembler.apply_template(template);
        }
        let tracker = Arc::new(BuildTracker::new(&build.id, self.config.max_log_bytes));

        let mut builds = self.builds.write().await;
        if builds.contains_key(&build.id) {
            return Err(EngineError::SandboxConflict {
                build: build.id.clone(),
            });
        }
        builds.insert(
            build.id.clone(),
            Arc::new(BuildSandbox {
                assembler: Mutex::new(assembler),
                tracker,
                created: AtomicBool::new(false),
            }),
        );
        info!("prepared sandbox for build {}", build.id);
        Ok(())
    }

    async fn setup_container(&self, build: &Build, container: &Container) -> Result<()> {
        let sandbox = self.sandbox(&build.id).await?;
        let mut assembler = sandbox.assembler.lock().await;
        assembler.stage_container(container)
    }

    async fn stream_build(&self, build: &Build, cancel: &CancellationToken) -> Result<()> {
        let sandbox = self.sandbox(&build.id).await?;
        let tracker = sandbox.tracker.clone();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream for build {} canceled before topology-ready", build.id);
                return Ok(());
            }
            _ = tracker.wait_topology_ready() => {}
        }

        tokio::spawn(tracker.clone().run_watch(self.pods()));

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream for build {} canceled before cache sync", build.id);
                return Ok(());
            }
            _ = tracker.wait_cache_synced() => {}
        }

        let names = sandbox.assembler.lock().await.container_names();
        self.spawn_log_streamers(&build.id, &sandbox, names);
        debug!("watch cache synchronized for build {}", build.id);
        Ok(())
    }

    async fn assemble_build(&self, build: &Build) -> Result<()> {
        let sandbox = self.sandbox(&build.id).await?;

        // Environment is filled last so later-staged containers see final values
        let pod = {
            let mut assembler = sandbox.assembler.lock().await;
            assembler.finalize_environment(build)?;
            let names = assembler.container_names();
            sandbox.tracker.mark_topology_ready(&names).await;
            assembler.build_pod()
        };

        // Creation never precedes cache synchronization, otherwise state
        // transitions could happen before anyone observes them
        sandbox.tracker.wait_cache_synced().await;

        // Set before the call, even if it fails, so cleanup is never skipped
        sandbox.created.store(true, Ordering::SeqCst);
        match self.pods().create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!("created sandbox for build {}", build.id);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(EngineError::SandboxConflict {
                    build: build.id.clone(),
                })
            }
            Err(e) => Err(EngineError::Backend(e.to_string())),
        }
    }

    async fn run_container(&self, build: &Build, container: &Container) -> Result<()> {
        let sandbox = self.sandbox(&build.id).await?;
        let index = self.checked_index(&sandbox, container).await?;

        info!(
            "activating container {} (sandbox index {}) with image {}",
            container.id, index, container.image
        );
        self.pods()
            .patch(
                &build.id,
                &PatchParams::default(),
                &Patch::Strategic(image_patch(container)),
            )
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn wait_container(&self, build: &Build, container: &Container) -> Result<ContainerState> {
        let sandbox = self.sandbox(&build.id).await?;
        sandbox.tracker.wait_terminated(&container.id).await
    }

    async fn tail_container(&self, build: &Build, container: &Container) -> Result<LogTail> {
        let sandbox = self.sandbox(&build.id).await?;
        sandbox.tracker.tail(&container.id).await
    }

    async fn inspect_container(
        &self,
        build: &Build,
        container: &Container,
    ) -> Result<ContainerState> {
        let sandbox = self.sandbox(&build.id).await?;
        sandbox.tracker.container_state(&container.id).await
    }

    async fn remove_build(&self, build: &Build) -> Result<()> {
        let Some(sandbox) = self.builds.write().await.remove(&build.id) else {
            debug!("remove for build {} with no live sandbox, nothing to do", build.id);
            return Ok(());
        };

        // Always reset the flag; deletion errors are logged, never fatal
        if sandbox.created.swap(false, Ordering::SeqCst) {
            match self.pods().delete(&build.id, &DeleteParams::default()).await {
                Ok(_) => info!("deleted sandbox for build {}", build.id),
                Err(e) => warn!("failed to delete sandbox for build {}: {}", build.id, e),
            }
        } else {
            debug!("sandbox for build {} was never created, skipping delete", build.id);
        }

        sandbox.tracker.stop().await;
        Ok(())
    }
}
