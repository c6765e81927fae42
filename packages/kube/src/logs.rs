// ABOUTME: Per-container log capture with a hard size cap and truncation marker
// ABOUTME: Streaming loop retries transient failures with jittered exponential backoff

use bytes::Bytes;
use convoy_engine::{LogState, LogTail};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

/// Default hard cap on captured log bytes per container
pub const DEFAULT_MAX_LOG_BYTES: usize = 4 * 1024 * 1024;

/// Literal marker appended when output exceeds the cap
pub const TRUNCATION_MARKER: &[u8] = b"\n[convoy] log output exceeded limit, remaining bytes dropped\n";

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Outcome of writing a chunk into a [`LogSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// The cap was exceeded; the sink is now terminal and further writes drop
    Truncated,
    /// The sink was already terminal before this write
    Dropped,
}

struct SinkInner {
    buf: Vec<u8>,
    /// Payload bytes captured, excluding the truncation marker
    captured: usize,
    subscribers: Vec<mpsc::UnboundedSender<Bytes>>,
}

/// Capped log buffer with live subscribers. The streaming task is the only
/// writer; tails replay the buffer snapshot and then follow live chunks.
pub struct LogSink {
    max_bytes: usize,
    inner: Mutex<SinkInner>,
    state_tx: watch::Sender<LogState>,
}

impl LogSink {
    pub fn new(max_bytes: usize) -> Self {
        let (state_tx, _) = watch::channel(LogState::Streaming);
        Self {
            max_bytes,
            inner: Mutex::new(SinkInner {
                buf: Vec::new(),
                captured: 0,
                subscribers: Vec::new(),
            }),
            state_tx,
        }
    }

    pub fn state(&self) -> LogState {
        self.state_tx.borrow().clone()
    }

    /// Single-fire state transition out of `Streaming`
    fn set_state(&self, next: LogState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == LogState::Streaming {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub async fn captured(&self) -> usize {
        self.inner.lock().await.captured
    }

    /// Append a chunk, fanning it out to live tails. Exceeding the cap keeps
    /// the leading bytes, appends the truncation marker, and seals the sink.
    pub async fn write(&self, chunk: &[u8]) -> WriteOutcome {
        let mut inner = self.inner.lock().await;
        if self.state().is_terminal() {
            return WriteOutcome::Dropped;
        }

        let remaining = self.max_bytes.saturating_sub(inner.captured);
        if chunk.len() <= remaining {
            inner.buf.extend_from_slice(chunk);
            inner.captured += chunk.len();
            Self::fan_out(&mut inner, chunk);
            WriteOutcome::Accepted
        } else {
            let kept = &chunk[..remaining];
            inner.buf.extend_from_slice(kept);
            inner.buf.extend_from_slice(TRUNCATION_MARKER);
            inner.captured += kept.len();
            if !kept.is_empty() {
                Self::fan_out(&mut inner, kept);
            }
            Self::fan_out(&mut inner, TRUNCATION_MARKER);
            self.set_state(LogState::Truncated);
            inner.subscribers.clear();
            WriteOutcome::Truncated
        }
    }

    /// Mark the stream cleanly finished
    pub async fn complete(&self) {
        let mut inner = self.inner.lock().await;
        if self.set_state(LogState::Complete) {
            inner.subscribers.clear();
        }
    }

    /// Record a terminal stream error. Partial output stays consumable.
    pub async fn fail(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if self.set_state(LogState::Failed(reason)) {
            inner.subscribers.clear();
        }
    }

    /// Open a tail: replay the current buffer as one chunk, then follow live
    /// output until the sink reaches a terminal state.
    pub async fn tail(&self) -> LogTail {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.buf.is_empty() {
            let _ = tx.send(Bytes::copy_from_slice(&inner.buf));
        }
        if !self.state().is_terminal() {
            inner.subscribers.push(tx);
        }
        LogTail::new(rx, self.state_tx.subscribe())
    }

    fn fan_out(inner: &mut SinkInner, chunk: &[u8]) {
        inner
            .subscribers
            .retain(|tx| tx.send(Bytes::copy_from_slice(chunk)).is_ok());
    }
}

/// Exponential backoff with randomized jitter and a delay cap
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(15),
            retries: 8,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), jittered into the upper
    /// half of the exponential window
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let jitter: f64 = rand::rng().random_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Tail one container's logs into `sink`, retrying transient failures.
///
/// `open` creates a fresh stream per attempt. Success requires at least one
/// captured byte followed by a clean end of stream; a stream that ends
/// cleanly without output is treated as not yet available and retried.
/// Exhausting retries records a `Failed` state on the sink and returns.
pub async fn stream_container_logs<F, Fut, R>(
    container: &str,
    sink: &LogSink,
    backoff: &Backoff,
    mut open: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<R, String>>,
    R: AsyncRead + Unpin,
{
    let mut last_error = "log stream never became available".to_string();

    for attempt in 0..=backoff.retries {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
        if sink.state().is_terminal() {
            return;
        }

        let mut reader = match open().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("failed to open log stream for {}: {}", container, e);
                last_error = e;
                continue;
            }
        };

        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    if sink.captured().await > 0 {
                        debug!("log stream for {} reached clean end", container);
                        sink.complete().await;
                        return;
                    }
                    debug!(
                        "log stream for {} ended empty, treating as not yet available",
                        container
                    );
                    last_error = "stream ended before any output".to_string();
                    break;
                }
                Ok(n) => match sink.write(&chunk[..n]).await {
                    WriteOutcome::Accepted => {}
                    WriteOutcome::Truncated => {
                        warn!("log output for {} exceeded cap, truncated", container);
                        return;
                    }
                    WriteOutcome::Dropped => return,
                },
                Err(e) => {
                    warn!("log stream for {} failed: {}", container, e);
                    last_error = e.to_string();
                    break;
                }
            }
        }
    }

    error!("giving up on log stream for {}: {}", container, last_error);
    sink.fail(last_error).await;
}
