use std::net::SocketAddr;

/// Severity of a [`LogEntry`], independent of the crate's own `tracing`
/// instrumentation - this is the embedder-facing feed described at the
/// boundary, not a mirror of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured record pushed to the embedder's log channel. Delivery is
/// lossy: a full channel simply drops the entry rather than blocking the
/// connection that produced it.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub op: &'static str,
    pub endpoint: Option<SocketAddr>,
    pub cause: Option<String>,
}

impl LogEntry {
    pub(crate) fn new(level: Level, op: &'static str) -> Self {
        Self {
            level,
            op,
            endpoint: None,
            cause: None,
        }
    }

    pub(crate) fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub(crate) fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// Best-effort, non-blocking send to an optional log channel.
pub(crate) fn emit(sender: Option<&tokio::sync::mpsc::Sender<LogEntry>>, entry: LogEntry) {
    if let Some(sender) = sender {
        let _ = sender.try_send(entry);
    }
}
