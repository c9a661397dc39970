use std::time::Duration;

/// Core error type for the retrieval layer.
///
/// Platform adapters should map their transport/RPC failures into this type so the
/// retry and classification logic can treat every backend the same way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Server-imposed flood control: the caller must wait `wait` before retrying.
    #[error("rate limited: a wait of {} seconds is required", .wait.as_secs())]
    RateLimited { wait: Duration },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// Raw platform RPC failure. The message is the platform's error string
    /// (e.g. `CHAT_WRITE_FORBIDDEN`, `FLOOD_WAIT_30`).
    #[error("{message} (code {code})")]
    Rpc { code: i32, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("gave up after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
