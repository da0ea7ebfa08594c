use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub password: String,
    /// Long-lived upstream credential, provisioned on first issue.
    pub api_key: Option<String>,
    pub name: Option<String>,
    pub is_pro: bool,
    pub status: String, // 'unused' | 'used' | 'expired'
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assigned_to_key: Option<String>,
}
