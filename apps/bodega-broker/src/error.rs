use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Everything the client API can fail with, mapped onto HTTP statuses
/// in `IntoResponse`.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("key not found")]
    InvalidKey,

    #[error("key is disabled")]
    KeyDisabled,

    #[error("key has expired")]
    KeyExpired,

    #[error("request quota exhausted")]
    QuotaExhausted,

    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("device limit reached ({max_devices} allowed)")]
    DeviceCapacityExceeded { max_devices: i32 },

    #[error("no account available: {reason}")]
    NoAccountAvailable { reason: &'static str },

    #[error("upstream login failed")]
    UpstreamLoginFailed { invalid_credentials: bool },

    #[error("no eligible roster member")]
    RotationNoEligibleMember,

    #[error("operation not supported for this key type")]
    WrongKeyType,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl BrokerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey => StatusCode::UNAUTHORIZED,
            Self::KeyDisabled
            | Self::KeyExpired
            | Self::QuotaExhausted
            | Self::DeviceCapacityExceeded { .. }
            | Self::WrongKeyType => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoAccountAvailable { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamLoginFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::RotationNoEligibleMember => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::KeyDisabled => "key_disabled",
            Self::KeyExpired => "key_expired",
            Self::QuotaExhausted => "quota_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::DeviceCapacityExceeded { .. } => "device_limit",
            Self::NoAccountAvailable { .. } => "no_account",
            Self::UpstreamLoginFailed { .. } => "upstream_login_failed",
            Self::RotationNoEligibleMember => "no_eligible_member",
            Self::WrongKeyType => "wrong_key_type",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        let body = match &self {
            Self::Internal(err) => {
                tracing::error!("Internal error: {err:#}");
                json!({ "error": kind, "detail": "internal server error" })
            }
            Self::RateLimited { retry_after_secs } => json!({
                "error": kind,
                "detail": self.to_string(),
                "retry_after": retry_after_secs,
            }),
            Self::DeviceCapacityExceeded { max_devices } => json!({
                "error": kind,
                "detail": self.to_string(),
                "max_devices": max_devices,
            }),
            Self::UpstreamLoginFailed {
                invalid_credentials,
            } => json!({
                "error": kind,
                "detail": self.to_string(),
                "invalid_credentials": invalid_credentials,
            }),
            other => json!({ "error": kind, "detail": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("X-Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_error_classes() {
        assert_eq!(BrokerError::InvalidKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(BrokerError::KeyExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            BrokerError::RateLimited {
                retry_after_secs: 10
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            BrokerError::NoAccountAvailable {
                reason: "account pool is empty"
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BrokerError::RotationNoEligibleMember.status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_header() {
        let response = BrokerError::RateLimited {
            retry_after_secs: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-Retry-After").unwrap(),
            &"42".parse::<axum::http::HeaderValue>().unwrap()
        );
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(BrokerError::InvalidKey.kind(), "invalid_key");
        assert_eq!(BrokerError::WrongKeyType.kind(), "wrong_key_type");
        assert_eq!(
            BrokerError::UpstreamLoginFailed {
                invalid_credentials: true
            }
            .kind(),
            "upstream_login_failed"
        );
    }
}
