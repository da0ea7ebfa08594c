use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Cached one-time login descriptor for a team key. The card exchange
/// issues these; a fresh row is served until expires_at passes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TeamLoginCache {
    pub id: i64,
    pub key_code: String,
    pub team_card_key: String,
    pub callback_url: String,
    pub email: String,
    pub nickname: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TeamLoginCache {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cached(expires_at: DateTime<Utc>) -> TeamLoginCache {
        TeamLoginCache {
            id: 1,
            key_code: "TEAM-1".to_string(),
            team_card_key: "card-1".to_string(),
            callback_url: "https://auth.example.com/cb".to_string(),
            email: "team@example.com".to_string(),
            nickname: None,
            cached_at: expires_at - Duration::minutes(10),
            expires_at,
        }
    }

    #[test]
    fn descriptor_is_fresh_until_expiry() {
        let now = Utc::now();
        assert!(cached(now + Duration::seconds(1)).is_fresh(now));
        assert!(!cached(now).is_fresh(now));
        assert!(!cached(now - Duration::minutes(5)).is_fresh(now));
    }
}
