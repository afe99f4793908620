use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// DingTalk answered with a non-success status.
    #[error("DingTalk {operation} failed ({status}): {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// A request was rejected before any remote call was made.
    #[error("invalid request: {message}")]
    InvalidInput { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
