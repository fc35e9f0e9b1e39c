use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chat_protocol::{ErrorCode, IdError};
use serde::Serialize;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

/// Failures surfaced by the chat components.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("not a member of this conversation")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool failure: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("broker failure: {0}")]
    Broker(#[from] redis::RedisError),
    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::Forbidden => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Storage(_)
            | Self::Pool(_)
            | Self::Serialization(_)
            | Self::Broker(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<IdError> for ChatError {
    fn from(err: IdError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResp {
    error: ErrorCode,
    message: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if self.code() == ErrorCode::Internal {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResp {
            error: self.code(),
            message: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}
