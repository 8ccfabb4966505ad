use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kiln_registry::DispatchError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("flush endpoints are disabled")]
    FlushDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(e) => match e {
                DispatchError::BadInput(_) => "bad_input",
                DispatchError::BadOidList { .. } => "bad_oid_list",
                DispatchError::UnknownModule(_) => "unknown_module",
                DispatchError::LockTimeout { .. } => "lock_timeout",
                DispatchError::StoreIo(_) => "store_io",
                DispatchError::ModuleFailure { .. } => "module_failure",
                DispatchError::Config(_) => "config",
            },
            Self::BadRequest(_) => "bad_request",
            Self::FlushDisabled => "forbidden",
            Self::Io(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dispatch(e) => match e {
                DispatchError::BadInput(_) | DispatchError::BadOidList { .. } => {
                    StatusCode::BAD_REQUEST
                }
                DispatchError::UnknownModule(_) => StatusCode::NOT_FOUND,
                DispatchError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::ModuleFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DispatchError::StoreIo(_) | DispatchError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::FlushDisabled => StatusCode::FORBIDDEN,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
