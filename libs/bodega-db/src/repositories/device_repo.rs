use anyhow::{Context, Result};
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count_active(&self, key_code: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM device_bindings WHERE key_code = $1 AND is_active = TRUE",
        )
        .bind(key_code)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active device bindings")
    }

    /// Soft unbind: clears is_active and keeps the row. Returns false when
    /// no active binding matched.
    pub async fn unbind(&self, key_code: &str, device_id: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE device_bindings SET is_active = FALSE
             WHERE key_code = $1 AND device_id = $2 AND is_active = TRUE",
        )
        .bind(key_code)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("Failed to unbind device")?;

        Ok(res.rows_affected() > 0)
    }
}
