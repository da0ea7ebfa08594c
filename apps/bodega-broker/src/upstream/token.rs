use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};

/// Reads the `exp` claim out of a JWT payload without verifying the
/// signature. We only need a refresh hint, not an authenticity check.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// A missing or unreadable token always needs a refresh, as does one
/// expiring within `margin_secs` from now.
pub fn needs_refresh(token: Option<&str>, now: DateTime<Utc>, margin_secs: i64) -> bool {
    let Some(token) = token else {
        return true;
    };
    match token_expiry(token) {
        Some(expires_at) => expires_at - now < chrono::Duration::seconds(margin_secs),
        None => true,
    }
}
