// ABOUTME: Runtime engine contract shared by all convoy sandbox backends
// ABOUTME: Exposes the build/container model, the Engine trait, and error types

pub mod engine;
pub mod error;
pub mod logs;
pub mod types;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use logs::{LogState, LogTail};
pub use types::{Build, Container, ContainerState, PullPolicy, Stage, INIT_ORDINAL};
