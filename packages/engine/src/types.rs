// ABOUTME: Build and container data model shared by all runtime backends
// ABOUTME: Encodes the ordinal/index protocol used to address sandbox containers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordinal reserved for the virtual init phase of every pipeline. The init
/// phase is never materialized as a sandbox container; real containers start
/// at ordinal 2.
pub const INIT_ORDINAL: u32 = 1;

/// One pipeline execution. The build identifier doubles as the sandbox name,
/// so at most one live sandbox may exist per identifier at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    /// Ordered step groups
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Detached sidecars running alongside the steps
    #[serde(default)]
    pub services: Vec<Container>,
}

impl Build {
    /// Step containers in pipeline order
    pub fn steps(&self) -> impl Iterator<Item = &Container> {
        self.stages.iter().flat_map(|s| s.containers.iter())
    }

    /// Steps followed by services, the full sandbox population in ordinal order
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.steps().chain(self.services.iter())
    }
}

/// A named group of steps that run as one phase of the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// A single pipeline step or service container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Stable identifier, also used as the container name inside the sandbox
    pub id: String,
    /// 1-based execution ordinal; ordinal 1 is the reserved init phase
    pub ordinal: u32,
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub pull: PullPolicy,
    /// Services run detached and are not waited on
    #[serde(default)]
    pub detached: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Container {
    /// Sandbox container index for this step, or `None` for the reserved init
    /// phase. Ordinal N maps to index N - 2 because ordinal 1 never
    /// materializes. This is the only place the offset is computed; callers
    /// must not rederive it.
    pub fn sandbox_index(&self) -> Option<usize> {
        if self.ordinal <= INIT_ORDINAL {
            None
        } else {
            Some((self.ordinal - INIT_ORDINAL - 1) as usize)
        }
    }
}

/// Image pull behavior requested for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
    OnStart,
}

/// Point-in-time terminal state of a tracked container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerState {
    pub exit_code: i32,
    pub finished: bool,
}
