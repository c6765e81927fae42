// ABOUTME: Engine trait defining the backend-agnostic build lifecycle contract
// ABOUTME: Backends implement sandbox assembly, sequenced activation, and teardown

use crate::error::Result;
use crate::logs::LogTail;
use crate::types::{Build, Container, ContainerState};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Lifecycle contract between the build executor and a sandbox backend.
///
/// Required call order per build: `setup_build`, then `setup_container` once
/// per pipeline container in ordinal order, then `stream_build` and
/// `assemble_build` concurrently, then any sequence of `run_container`,
/// `wait_container`, `tail_container`, and `inspect_container`, and finally
/// `remove_build`. Builds are fully isolated; nothing is shared across build
/// identifiers.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Initialize the sandbox specification and tracker for a build. Fails
    /// fatally on bad backend configuration or a missing required template.
    async fn setup_build(&self, build: &Build) -> Result<()>;

    /// Stage one placeholder entry for a pipeline container. Entries are
    /// appended in call order and must preserve the ordinal/index mapping
    /// exactly. The reserved init phase is accepted and ignored.
    async fn setup_container(&self, build: &Build, container: &Container) -> Result<()>;

    /// Bridge between "topology known" and "ready to observe state": blocks
    /// until `assemble_build` signals topology-ready, starts populating the
    /// watch cache, then blocks again until the cache is synchronized.
    /// Returns `Ok(())` without error if `cancel` fires while waiting, since
    /// the caller is already aborting.
    async fn stream_build(&self, build: &Build, cancel: &CancellationToken) -> Result<()>;

    /// Finalize per-container environment, signal topology-ready, wait for
    /// cache synchronization, then issue the single atomic sandbox creation
    /// call. A conflict on creation is fatal and indicates build-id reuse.
    async fn assemble_build(&self, build: &Build) -> Result<()>;

    /// Activate an already-staged container by patching its image field.
    /// Never creates a new container.
    async fn run_container(&self, build: &Build, container: &Container) -> Result<()>;

    /// Block until the container reaches a terminal state. No internal
    /// timeout; the caller's own cancellation governs the deadline.
    async fn wait_container(&self, build: &Build, container: &Container) -> Result<ContainerState>;

    /// Open-ended stream of the container's captured logs plus the recorded
    /// stream-error state.
    async fn tail_container(&self, build: &Build, container: &Container) -> Result<LogTail>;

    /// Point-in-time state of the container served from the watch cache, not
    /// a fresh network call.
    async fn inspect_container(
        &self,
        build: &Build,
        container: &Container,
    ) -> Result<ContainerState>;

    /// Delete the sandbox and stop the tracker. Idempotent: a no-op when
    /// nothing was ever created. Backend deletion errors are logged, never
    /// fatal.
    async fn remove_build(&self, build: &Build) -> Result<()>;
}
