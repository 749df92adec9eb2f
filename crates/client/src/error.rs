use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A push transport could not be opened or broke mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with an error body.
    #[error("server returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("timed out")]
    Timeout,

    /// Every transport, polling included, has given up.
    #[error("realtime updates unavailable")]
    RealtimeUnavailable,

    #[error("not connected")]
    NotConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
