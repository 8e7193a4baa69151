use std::fmt;
use std::sync::Arc;

/// Severity tag attached to a [`LogEvent`], mirroring the three levels the coordinator
/// distinguishes: routine progress, a recovered anomaly, and a propagated failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warn => f.write_str("warn"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// A single coordinator log event: one state transition or backend call outcome.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub severity: Severity,
    pub message: String,
    /// The unique lock identifier (`"{lock_group}|{lock_id}"`) this event concerns, if
    /// any. Lets callers filter/group events by lock without parsing `message`.
    pub lock_id: Option<String>,
}

impl LogEvent {
    pub(crate) fn new(severity: Severity, message: String, lock_id: Option<String>) -> Self {
        Self {
            severity,
            message,
            lock_id,
        }
    }
}

/// User-supplied sink for [`LogEvent`]s, set on [`crate::LockClientBuilder`].
///
/// Every coordinator state transition and backend call outcome also goes through
/// `tracing`; this hook is an additional, optional channel for callers who want events
/// without wiring a `tracing` subscriber. The hook is called synchronously from the
/// acquisition/release path — it must not block meaningfully. Offload any slow work
/// (e.g. a network call) to a channel or a spawned task inside the hook itself.
pub type LogHook = Arc<dyn Fn(LogEvent) + Send + Sync>;
