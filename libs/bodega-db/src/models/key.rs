use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Key {
    pub id: i64,
    pub key_code: String,
    pub key_type: String, // 'unlimited' | 'limited' | 'pro' | 'team'
    pub duration_days: i32,
    pub duration_hours: i32,
    pub status: String, // 'inactive' | 'active' | 'expired'
    pub is_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub daily_request_count: i32,
    pub last_reset_date: Option<NaiveDate>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_request_ip: Option<String>,
    /// -1 = unbounded, 0 = no account entitlement, >0 = fixed allowance.
    pub account_limit: i32,
    pub max_devices: i32,
    pub team_card_key: Option<String>,
    pub roster_group_id: Option<i64>,
    pub last_pro_switch_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Key {
    /// Validity window granted at activation.
    pub fn grant_duration(&self) -> Duration {
        Duration::days(i64::from(self.duration_days))
            + Duration::hours(i64::from(self.duration_hours))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == "expired" || self.expires_at.is_some_and(|at| at <= now)
    }
}
