// ABOUTME: Watch-based tracker keeping a local cache of one build's sandbox state
// ABOUTME: Owns the readiness gates and per-container one-shot termination signals

use crate::logs::LogSink;
use convoy_engine::{ContainerState, EngineError, LogTail, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config, Event};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One-shot broadcast signal: raised at most once, observed by any number of
/// waiters, safe against duplicate raises.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    token: CancellationToken,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the gate. Idempotent; repeated raises are no-ops.
    pub fn raise(&self) {
        self.token.cancel();
    }

    /// Wait until the gate has been raised. Returns immediately if it already
    /// was.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Watch lifecycle of a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    NotStarted,
    /// Watching but the cache has no consistent snapshot yet
    Watching,
    Synced,
    Stopped,
}

/// Derived per-container state: termination signal, exit code, captured logs
struct ContainerTracker {
    terminated: Gate,
    exit_code: OnceLock<i32>,
    sink: Arc<LogSink>,
}

impl ContainerTracker {
    fn new(max_log_bytes: usize) -> Self {
        Self {
            terminated: Gate::new(),
            exit_code: OnceLock::new(),
            sink: Arc::new(LogSink::new(max_log_bytes)),
        }
    }
}

/// Per-build watch subscription plus derived container state. Exactly one
/// tracker exists per live build; the watch task is the only writer after
/// topology finalization.
pub struct BuildTracker {
    build_id: String,
    state: Mutex<TrackerState>,
    topology_ready: Gate,
    cache_synced: Gate,
    stop: CancellationToken,
    containers: RwLock<HashMap<String, Arc<ContainerTracker>>>,
    pod: Mutex<Option<Pod>>,
    max_log_bytes: usize,
}

impl BuildTracker {
    pub fn new(build_id: &str, max_log_bytes: usize) -> Self {
        Self {
            build_id: build_id.to_string(),
            state: Mutex::new(TrackerState::NotStarted),
            topology_ready: Gate::new(),
            cache_synced: Gate::new(),
            stop: CancellationToken::new(),
            containers: RwLock::new(HashMap::new()),
            pod: Mutex::new(None),
            max_log_bytes,
        }
    }

    /// Label selector isolating this build's sandbox in the watch
    pub fn selector(&self) -> String {
        format!("{}={}", crate::assembler::BUILD_LABEL, self.build_id)
    }

    pub async fn state(&self) -> TrackerState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: TrackerState) {
        let mut state = self.state.lock().await;
        if *state != next {
            debug!("tracker for build {}: {:?} -> {:?}", self.build_id, *state, next);
            *state = next;
        }
    }

    /// Finalize the container topology: build the per-container tracker map
    /// once and raise the topology-ready gate. The map is never repopulated.
    pub async fn mark_topology_ready(&self, names: &[String]) {
        {
            let mut containers = self.containers.write().await;
            if containers.is_empty() {
                for name in names {
                    containers.insert(name.clone(), Arc::new(ContainerTracker::new(self.max_log_bytes)));
                }
            } else {
                warn!("topology for build {} already finalized", self.build_id);
            }
        }
        info!(
            "topology ready for build {} ({} containers)",
            self.build_id,
            names.len()
        );
        self.topology_ready.raise();
    }

    pub async fn wait_topology_ready(&self) {
        self.topology_ready.wait().await;
    }

    pub async fn wait_cache_synced(&self) {
        self.cache_synced.wait().await;
    }

    /// Record that the watch cache holds an initial consistent snapshot
    pub async fn mark_cache_synced(&self) {
        self.set_state(TrackerState::Synced).await;
        self.cache_synced.raise();
    }

    /// Update handler for one observed pod state. Caches the snapshot and
    /// raises the termination signal of every container reported terminal.
    /// Safe against repeated terminal observations.
    pub async fn observe_pod(&self, pod: &Pod) {
        {
            let mut cached = self.pod.lock().await;
            *cached = Some(pod.clone());
        }

        let Some(statuses) = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
        else {
            return;
        };

        let containers = self.containers.read().await;
        for status in statuses {
            let Some(tracker) = containers.get(&status.name) else {
                continue;
            };
            let Some(terminated) = status.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
                continue;
            };
            if tracker.exit_code.set(terminated.exit_code).is_ok() {
                debug!(
                    "container {} of build {} reached terminal state (exit code {})",
                    status.name, self.build_id, terminated.exit_code
                );
            }
            tracker.terminated.raise();
        }
    }

    /// Watch loop populating the cache. Spawned once per build after
    /// topology-ready; runs until the tracker is stopped.
    pub async fn run_watch(self: Arc<Self>, pods: Api<Pod>) {
        self.set_state(TrackerState::Watching).await;
        let config = Config::default().labels(&self.selector());
        let mut events = Box::pin(watcher(pods, config));

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                event = events.try_next() => match event {
                    Ok(Some(Event::InitDone)) => self.mark_cache_synced().await,
                    Ok(Some(Event::InitApply(pod))) | Ok(Some(Event::Apply(pod))) => {
                        self.observe_pod(&pod).await;
                    }
                    Ok(Some(Event::Init)) => {}
                    Ok(Some(Event::Delete(_))) => {
                        debug!("sandbox for build {} deleted", self.build_id);
                    }
                    Ok(None) => break,
                    // The watcher recovers on its own; these are transient
                    Err(e) => warn!("watch hiccup for build {}: {}", self.build_id, e),
                },
            }
        }

        self.set_state(TrackerState::Stopped).await;
    }

    /// Block until the container is reported terminal, then return its state.
    /// No internal timeout; the caller's cancellation governs the deadline.
    pub async fn wait_terminated(&self, name: &str) -> Result<ContainerState> {
        let tracker = self.container(name).await?;
        tracker.terminated.wait().await;
        Ok(ContainerState {
            exit_code: tracker.exit_code.get().copied().unwrap_or(0),
            finished: true,
        })
    }

    /// Point-in-time state served from the watch cache, never a live query
    pub async fn container_state(&self, name: &str) -> Result<ContainerState> {
        let tracker = self.container(name).await?;
        debug!(
            "inspecting {} from watch cache (pods/{} status.containerStatuses[name={}])",
            name, self.build_id, name
        );

        if let Some(code) = tracker.exit_code.get() {
            return Ok(ContainerState {
                exit_code: *code,
                finished: true,
            });
        }

        let cached = self.pod.lock().await;
        let terminated = cached
            .as_ref()
            .and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|s| s.name == name))
            .and_then(|status| status.state.as_ref())
            .and_then(|state| state.terminated.as_ref());

        Ok(match terminated {
            Some(t) => ContainerState {
                exit_code: t.exit_code,
                finished: true,
            },
            None => ContainerState::default(),
        })
    }

    /// Open a log tail for a tracked container
    pub async fn tail(&self, name: &str) -> Result<LogTail> {
        Ok(self.container(name).await?.sink.tail().await)
    }

    /// Log sink written by the container's streaming task
    pub async fn sink(&self, name: &str) -> Result<Arc<LogSink>> {
        Ok(self.container(name).await?.sink.clone())
    }

    /// Stop the watch task and mark the tracker stopped
    pub async fn stop(&self) {
        self.stop.cancel();
        self.set_state(TrackerState::Stopped).await;
    }

    async fn container(&self, name: &str) -> Result<Arc<ContainerTracker>> {
        self.containers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownContainer(name.to_string()))
    }
}
