//! Unified HTTP error type for axum request handlers.
//!
//! [`SidecarError`] carries every failure class the request path can hit and
//! converts itself into the `{ "error": ..., "budget"?: ... }` envelope with
//! the right status code via [`IntoResponse`]. Handlers return
//! `Result<T, SidecarError>` and propagate with `?` — no manual `map_err`,
//! no boilerplate.
//!
//! Anything not covered by a typed variant (bugs, extension failures) rides
//! the blanket `From<anyhow::Error>` into [`SidecarError::Internal`] and
//! surfaces as a 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::budget::BudgetCheck;

/// Request-path failure classes, mapped to HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    /// Malformed JSON body — 400, never retried.
    #[error("invalid request body: {0}")]
    Parse(String),

    /// Unknown or non-virtual model id — 500, surfaced verbatim.
    #[error("{0}")]
    VirtualModel(String),

    /// Budget block — 429 with the failing check attached.
    #[error("budget exhausted for tier {tier}")]
    BudgetExceeded { tier: String, budget: BudgetCheck },

    /// The routing decision named a provider with no credentials — 500.
    #[error("no provider credentials configured for `{0}`")]
    UnknownProvider(String),

    /// The upstream call itself failed (network, DNS, TLS) — 502.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] anyhow::Error),

    /// The upstream did not answer within the configured deadline — 504.
    #[error("upstream request timed out after {0} ms")]
    Timeout(u64),

    /// Everything else — 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SidecarError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::VirtualModel(_) | Self::UnknownProvider(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for SidecarError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "handler error");
        let status = self.status();
        let body = match &self {
            Self::BudgetExceeded { budget, .. } => {
                json!({ "error": self.to_string(), "budget": budget })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnforcementAction;

    fn exhausted_check() -> BudgetCheck {
        BudgetCheck {
            allowed: false,
            daily_remaining: Some(-0.01),
            weekly_remaining: None,
            alert_triggered: true,
            enforcement_action: EnforcementAction::Block,
        }
    }

    #[test]
    fn statuses_match_error_classes() {
        assert_eq!(SidecarError::Parse("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            SidecarError::VirtualModel("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SidecarError::BudgetExceeded { tier: "simple".into(), budget: exhausted_check() }
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            SidecarError::UnknownProvider("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SidecarError::Upstream(anyhow::anyhow!("conn refused")).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(SidecarError::Timeout(5000).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            SidecarError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn budget_errors_attach_the_failing_check() {
        let err = SidecarError::BudgetExceeded {
            tier: "simple".into(),
            budget: exhausted_check(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].as_str().unwrap().contains("budget"));
        assert_eq!(body["budget"]["allowed"], false);
        assert_eq!(body["budget"]["enforcement_action"], "block");
    }
}
