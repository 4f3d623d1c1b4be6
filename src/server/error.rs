//! Client-facing error taxonomy.
//!
//! Only this layer decides what a client sees. Subsystem errors convert
//! into one of the fixed categories here; internal detail stops at the
//! log line.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::chat::ChatError;
use crate::providers::ProviderError;
use crate::quota::QuotaExceeded;
use crate::rag::RagError;
use crate::validate::ValidationError;

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument(String),
    ResourceExhausted(String),
    NotFound(String),
    DeadlineExceeded,
    Unavailable(String),
    FailedPrecondition(String),
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Self::Internal => "INTERNAL",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthenticated => "unauthenticated".into(),
            Self::PermissionDenied => "permission denied".into(),
            Self::InvalidArgument(m) => m.clone(),
            Self::ResourceExhausted(m) => m.clone(),
            Self::NotFound(m) => m.clone(),
            Self::DeadlineExceeded => "deadline exceeded".into(),
            Self::Unavailable(m) => m.clone(),
            Self::FailedPrecondition(m) => m.clone(),
            Self::Internal => "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

impl From<QuotaExceeded> for ApiError {
    fn from(e: QuotaExceeded) -> Self {
        crate::metrics::record_quota_rejection(e.scope.as_str());
        Self::ResourceExhausted(e.to_string())
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        match &e {
            ProviderError::Timeout => Self::DeadlineExceeded,
            ProviderError::Cancelled => Self::DeadlineExceeded,
            // Retries are exhausted by the time an error reaches here.
            ProviderError::RateLimited
            | ProviderError::Transport(_)
            | ProviderError::EmptyResponse
            | ProviderError::Upstream { retryable: true, .. } => {
                warn!(error = %e, "upstream unavailable after retries");
                Self::Unavailable("upstream provider unavailable".into())
            }
            ProviderError::Upstream { .. } | ProviderError::Malformed(_) => {
                warn!(error = %e, "upstream provider failed");
                Self::Unavailable("upstream provider unavailable".into())
            }
            ProviderError::Auth => {
                Self::FailedPrecondition("provider credentials rejected".into())
            }
            ProviderError::InvalidRequest(_) => {
                Self::FailedPrecondition("provider rejected the request".into())
            }
        }
    }
}

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        match &e {
            RagError::InvalidId(_) => Self::InvalidArgument(e.to_string()),
            RagError::StoreNotFound(_) => Self::NotFound(e.to_string()),
            RagError::Extractor(_) | RagError::Embedder(_) | RagError::Index(_) => {
                warn!(error = %e, "retrieval backend failed");
                Self::Unavailable("retrieval backend unavailable".into())
            }
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Validation(v) => v.into(),
            ChatError::PermissionDenied(_) => Self::PermissionDenied,
            ChatError::UnknownProvider(name) => {
                Self::InvalidArgument(format!("provider {name:?} is not available"))
            }
            ChatError::NoProviderAvailable => {
                Self::FailedPrecondition("tenant has no enabled provider".into())
            }
            ChatError::Quota(q) => q.into(),
            ChatError::Provider(p) => p.into(),
            ChatError::Internal(source) => {
                error!(error = %source, "internal error");
                Self::Internal
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %e, "internal error");
        Self::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::InvalidArgument("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ResourceExhausted("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_errors_leak_nothing() {
        let api: ApiError = anyhow::anyhow!("secret connection string sk-123").into();
        assert_eq!(api.message(), "internal error");
    }

    #[test]
    fn provider_auth_maps_to_failed_precondition() {
        let api: ApiError = ProviderError::Auth.into();
        assert_eq!(api.status(), StatusCode::PRECONDITION_FAILED);
        // The vendor's own words never reach the client.
        assert!(!api.message().contains("bearer"));
    }
}
