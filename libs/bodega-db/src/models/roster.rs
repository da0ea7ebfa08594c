use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RosterGroup {
    pub id: i64,
    pub name: String,
    pub key_code: String,
    pub admin_email: String,
    pub admin_password: String,
    pub admin_token: Option<String>,
    pub upstream_group_id: Option<String>,
    pub is_active: bool,
    pub credits_threshold: i32,
    pub check_interval_minutes: i32,
    pub current_member_id: Option<i64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub switch_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// At most one member per group carries is_current. A member marked
/// is_exhausted is never selected again.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RosterMember {
    pub id: i64,
    pub group_id: i64,
    pub email: String,
    pub password: String,
    pub api_key: Option<String>,
    pub name: Option<String>,
    pub is_enabled: bool,
    pub is_current: bool,
    pub is_exhausted: bool,
    pub last_credits: i32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SwitchRecord {
    pub id: i64,
    pub group_id: i64,
    pub from_member_id: Option<i64>,
    pub to_member_id: i64,
    pub from_email: Option<String>,
    pub to_email: String,
    pub reason: String,
    pub credits_before: Option<i32>,
    pub switched_at: DateTime<Utc>,
}
