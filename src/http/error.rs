//! Maps the core's per-module error enums onto the HTTP status/body contract
//! in §7. Every handler returns `Result<_, HttpError>`; actix dispatches the
//! body via `ResponseError::error_response`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::clients::ClientError;
use crate::nodes::NodeError;
use crate::policy::PolicyError;
use crate::store::StoreError;
use crate::trust::TrustError;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String, &'static str),

    #[error("{0}")]
    Validation(String, &'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("admin token invalid")]
    Unauthorized,

    #[error("no free address in pool")]
    PoolExhausted,

    #[error("expired")]
    Expired,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        match self {
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::Conflict(_, _) => StatusCode::CONFLICT,
            HttpError::Validation(_, _) => StatusCode::BAD_REQUEST,
            HttpError::Forbidden(_) => StatusCode::FORBIDDEN,
            HttpError::Unauthorized => StatusCode::UNAUTHORIZED,
            HttpError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Expired => StatusCode::GONE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = match self {
            HttpError::NotFound(code) => code,
            HttpError::Conflict(_, code) => code,
            HttpError::Validation(_, code) => code,
            HttpError::Forbidden(code) => code,
            HttpError::Unauthorized => "UNAUTHORIZED",
            HttpError::PoolExhausted => "IP_POOL_EXHAUSTED",
            HttpError::Expired => "EXPIRED",
            HttpError::Internal(_) => "INTERNAL_ERROR",
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: code,
            message: self.to_string(),
        })
    }
}

impl From<NodeError> for HttpError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::NotFound => HttpError::NotFound("NODE_NOT_FOUND"),
            NodeError::HostnameConflict(h) => {
                HttpError::Conflict(format!("hostname `{h}` already registered"), "HOSTNAME_EXISTS")
            }
            NodeError::PoolExhausted => HttpError::PoolExhausted,
            NodeError::NotActive => HttpError::Forbidden("NODE_NOT_ACTIVE"),
            NodeError::Store(e) => HttpError::Internal(e.to_string()),
        }
    }
}

impl From<ClientError> for HttpError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound => HttpError::NotFound("DEVICE_NOT_FOUND"),
            ClientError::DeviceNameExists(n) => {
                HttpError::Conflict(format!("device `{n}` already registered"), "DEVICE_NAME_EXISTS")
            }
            ClientError::PoolExhausted => HttpError::PoolExhausted,
            ClientError::InvalidToken => HttpError::Validation("invalid or consumed config token".to_string(), "INVALID_TOKEN"),
            ClientError::Expired => HttpError::Expired,
            ClientError::Store(e) => HttpError::Internal(e.to_string()),
        }
    }
}

impl From<PolicyError> for HttpError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound => HttpError::NotFound("POLICY_NOT_FOUND"),
            PolicyError::PolicyExists(n) => {
                HttpError::Conflict(format!("policy `{n}` already exists"), "POLICY_EXISTS")
            }
            PolicyError::Validation(msg) => HttpError::Validation(msg, "INVALID_POLICY"),
            PolicyError::Store(e) => HttpError::Internal(e.to_string()),
        }
    }
}

impl From<TrustError> for HttpError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::NotFound => HttpError::NotFound("NODE_NOT_FOUND"),
            TrustError::Store(e) => HttpError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        HttpError::Internal(err.to_string())
    }
}
