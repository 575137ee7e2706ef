use crate::processor::ProcessorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Service error taxonomy. Validation and not-found reject synchronously
/// with no side effects; processor errors surface to the caller while the
/// payment stays non-terminal; conflicts are user-retryable state races;
/// compensation failures mean real money may be in an inconsistent state
/// and must reach an operator.
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("compensation failed, hold {hold_id} may be dangling: {reason}")]
    Compensation { hold_id: String, reason: String },
    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<diesel_async::pooled_connection::PoolError>),
    #[error("{0}")]
    Internal(String),
}

impl EscrowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<shared::MoneyError> for EscrowError {
    fn from(e: shared::MoneyError) -> Self {
        // Money arithmetic going wrong mid-settlement is a configuration
        // bug, never a user-facing condition.
        Self::Internal(format!("money arithmetic error: {e}"))
    }
}

impl IntoResponse for EscrowError {
    fn into_response(self) -> Response {
        let status = match &self {
            EscrowError::Unauthorized => StatusCode::UNAUTHORIZED,
            EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
            EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
            EscrowError::Forbidden(_) => StatusCode::FORBIDDEN,
            EscrowError::Conflict(_) => StatusCode::CONFLICT,
            EscrowError::Processor(e) if e.is_decline() => StatusCode::PAYMENT_REQUIRED,
            EscrowError::Processor(_) => StatusCode::BAD_GATEWAY,
            EscrowError::Compensation { .. }
            | EscrowError::Db(_)
            | EscrowError::Pool(_)
            | EscrowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let EscrowError::Compensation { hold_id, reason } = &self {
            // Operator-visible: the processor hold could not be released
            // after a failed local transition. Requires manual
            // reconciliation; never swallow.
            error!(hold_id = %hold_id, reason = %reason, "COMPENSATION FAILURE");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        let cases = [
            (EscrowError::validation("missing job"), StatusCode::BAD_REQUEST),
            (EscrowError::not_found("job not found"), StatusCode::NOT_FOUND),
            (EscrowError::Forbidden("not yours"), StatusCode::FORBIDDEN),
            (
                EscrowError::conflict("promo no longer available"),
                StatusCode::CONFLICT,
            ),
            (
                EscrowError::Internal("bad config".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn card_declines_map_to_payment_required() {
        let declined = EscrowError::Processor(ProcessorError::Api {
            kind: "card_error".into(),
            code: Some("card_declined".into()),
            message: Some("Your card was declined.".into()),
            status: Some(402),
        });
        assert_eq!(declined.into_response().status(), StatusCode::PAYMENT_REQUIRED);

        let outage = EscrowError::Processor(ProcessorError::Http("503".into()));
        assert_eq!(outage.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
