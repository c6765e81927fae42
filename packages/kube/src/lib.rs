// ABOUTME: Kubernetes backend implementing the convoy runtime engine contract
// ABOUTME: Pods host one sandbox per build; containers activate via image patches

pub mod assembler;
pub mod config;
pub mod engine;
pub mod logs;
pub mod template;
pub mod tracker;

pub use assembler::{PodAssembler, BUILD_LABEL, PLACEHOLDER_IMAGE};
pub use config::{BackoffConfig, KubeBackendConfig, TemplateSource};
pub use engine::KubeEngine;
pub use logs::{Backoff, LogSink, DEFAULT_MAX_LOG_BYTES, TRUNCATION_MARKER};
pub use template::PodTemplate;
pub use tracker::{BuildTracker, Gate, TrackerState};
