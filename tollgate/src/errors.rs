use crate::db::errors::DbError;
use crate::types::BudgetLayer;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

/// Stable machine-readable codes for authorization denials. Serialized into
/// responses, so renaming a variant's wire form is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ToolAccessDenied,
    ModelAccessDenied,
    RouteAccessDenied,
    ScopeAccessDenied,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::ToolAccessDenied => "tool_access_denied",
            DenyReason::ModelAccessDenied => "model_access_denied",
            DenyReason::RouteAccessDenied => "route_access_denied",
            DenyReason::ScopeAccessDenied => "scope_access_denied",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Credential missing, unknown, expired, blocked, or malformed
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    /// Authenticated but denied by policy
    #[error("Permission denied ({reason}): {detail}")]
    PermissionDenied { reason: DenyReason, detail: String },

    /// A budget layer's ceiling is already met or exceeded
    #[error("Budget exceeded at {layer} layer for {entity_id}")]
    BudgetExceeded {
        layer: BudgetLayer,
        entity_id: String,
        spent: Decimal,
        limit: Decimal,
    },

    /// Request or token rate ceiling hit for the current window
    #[error("Rate limited on {scope}")]
    RateLimited { scope: String, retry_after_secs: u64 },

    /// Storage could not answer within policy and the deployment fails closed
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A credential with the same secret already exists
    #[error("Duplicate key: {key_hash}")]
    DuplicateKey { key_hash: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DuplicateKey { .. } => StatusCode::CONFLICT,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::AuthFailed { message } => message.clone(),
            Error::PermissionDenied { reason, detail } => format!("{reason}: {detail}"),
            Error::BudgetExceeded { layer, .. } => {
                format!("Budget exceeded at the {layer} layer")
            }
            Error::RateLimited { scope, .. } => format!("Rate limit exceeded for {scope}"),
            Error::StorageUnavailable { .. } => "Service temporarily unavailable".to_string(),
            Error::DuplicateKey { .. } => "A key with this value already exists".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => {
                    "Invalid reference to related resource".to_string()
                }
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Unavailable { .. } => "Service temporarily unavailable".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::StorageUnavailable { .. } | Error::Database(DbError::Unavailable { .. }) => {
                tracing::error!("Storage unavailable: {}", self);
            }
            Error::Database(_) | Error::DuplicateKey { .. } => {
                tracing::warn!("Constraint error: {}", self);
            }
            Error::AuthFailed { .. } | Error::PermissionDenied { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BudgetExceeded { .. } | Error::RateLimited { .. } => {
                tracing::info!("Enforcement rejection: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::PermissionDenied { reason, detail } => {
                use serde_json::json;
                let body = json!({
                    "error": reason,
                    "message": detail,
                });
                (status, axum::response::Json(body)).into_response()
            }
            Error::BudgetExceeded {
                layer,
                entity_id,
                spent,
                limit,
            } => {
                use serde_json::json;
                let body = json!({
                    "error": "budget_exceeded",
                    "layer": layer,
                    "entity_id": entity_id,
                    "spent": spent,
                    "limit": limit,
                });
                (status, axum::response::Json(body)).into_response()
            }
            Error::RateLimited {
                scope,
                retry_after_secs,
            } => {
                use serde_json::json;
                let body = json!({
                    "error": "rate_limited",
                    "scope": scope,
                    "retry_after": retry_after_secs,
                });
                (
                    status,
                    [("Retry-After", retry_after_secs.to_string())],
                    axum::response::Json(body),
                )
                    .into_response()
            }
            _ => {
                let user_message = self.user_message();
                (status, user_message).into_response()
            }
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_reason_wire_codes_are_snake_case() {
        let encoded = serde_json::to_string(&DenyReason::ToolAccessDenied).unwrap();
        assert_eq!(encoded, "\"tool_access_denied\"");
    }

    #[test]
    fn test_status_codes() {
        let auth = Error::AuthFailed {
            message: "unknown key".to_string(),
        };
        assert_eq!(auth.status_code(), StatusCode::UNAUTHORIZED);

        let denied = Error::PermissionDenied {
            reason: DenyReason::ModelAccessDenied,
            detail: "model not allowed".to_string(),
        };
        assert_eq!(denied.status_code(), StatusCode::FORBIDDEN);

        let budget = Error::BudgetExceeded {
            layer: BudgetLayer::Team,
            entity_id: "t-1".to_string(),
            spent: Decimal::new(101, 0),
            limit: Decimal::new(100, 0),
        };
        assert_eq!(budget.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let dup = Error::DuplicateKey {
            key_hash: "abc".to_string(),
        };
        assert_eq!(dup.status_code(), StatusCode::CONFLICT);

        let unavailable = Error::StorageUnavailable {
            message: "pool timed out".to_string(),
        };
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_user_message_hides_storage_detail() {
        let err = Error::StorageUnavailable {
            message: "connection refused to 10.0.0.3:5432".to_string(),
        };
        assert!(!err.user_message().contains("10.0.0.3"));
    }
}
