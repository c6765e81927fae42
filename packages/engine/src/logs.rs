// ABOUTME: Contract-level log tailing types returned by Engine::tail_container
// ABOUTME: Open-ended chunk stream plus the recorded terminal state of the stream

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

/// Terminal state of a container log stream.
///
/// `Truncated` is a distinct non-error terminal condition: the stream was
/// stopped because captured output exceeded the backend's size cap, and the
/// buffer carries a literal truncation marker. `Failed` means retries were
/// exhausted; partial output stays consumable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogState {
    #[default]
    Streaming,
    Complete,
    Truncated,
    Failed(String),
}

impl LogState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogState::Streaming)
    }
}

/// Read-only, open-ended byte stream of captured container logs.
///
/// The first chunk replays everything captured so far; later chunks arrive
/// live. The channel closes once the underlying stream reaches any terminal
/// state.
#[derive(Debug)]
pub struct LogTail {
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
    state: watch::Receiver<LogState>,
}

impl LogTail {
    pub fn new(receiver: mpsc::UnboundedReceiver<Bytes>, state: watch::Receiver<LogState>) -> Self {
        Self { receiver, state }
    }

    /// Recorded stream state at this moment
    pub fn state(&self) -> LogState {
        self.state.borrow().clone()
    }

    /// Drain the stream to completion and return all captured bytes
    pub async fn collect(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.receiver.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}
