use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per (key, device) pair. Unbinding clears is_active and keeps
/// the row, so first_bound_at and request_count survive rebinds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceBinding {
    pub id: i64,
    pub key_code: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub first_bound_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub request_count: i64,
    pub is_active: bool,
}
