//! Maps the `EmulatorError` kind taxonomy onto HTTP status codes, per the
//! exact mapping the control server contract specifies: request handlers
//! return a uniform `{kind, message}` body regardless of which sub-manager's
//! error produced it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use netsim_core::EmulatorError;
use netsim_proto::{ApiError, ErrorKind};

pub struct HttpError(ApiError);

impl From<EmulatorError> for HttpError {
    fn from(e: EmulatorError) -> Self {
        HttpError(e.to_api_error())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::AddressConflict => StatusCode::CONFLICT,
            ErrorKind::Privilege => StatusCode::FORBIDDEN,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::KernelError | ErrorKind::Internal | ErrorKind::ResourceExhausted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.0)).into_response()
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
