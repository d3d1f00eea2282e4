/// Failure reported by a listener callback.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Delivery failures inside the notification path. These are logged at the
/// point of failure and never surface to the code that dispatched the change.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("listener {listener} failed: {source}")]
    Listener {
        listener: String,
        #[source]
        source: ListenerError,
    },

    #[error("listener {0} panicked")]
    ListenerPanicked(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink {sink} failed: {message}")]
    Sink { sink: String, message: String },
}

impl NotifyError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Listener { .. } => "listener_error",
            Self::ListenerPanicked(_) => "listener_panicked",
            Self::Serialization(_) => "serialization",
            Self::Sink { .. } => "sink_failed",
        }
    }
}
