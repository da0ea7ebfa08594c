//! Device binding admission.
//!
//! Bindings are per (key, device) and soft-deleted: unbinding clears
//! is_active but keeps the row, so a returning device reactivates its
//! old binding instead of creating a new one.

use bodega_db::models::device::DeviceBinding;
use bodega_db::models::key::Key;
use bodega_db::repositories::device_repo::DeviceRepository;
use sqlx::PgConnection;

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    RefreshActive,
    Reactivate,
    InsertNew,
    Reject,
}

/// Pure admission decision. A device holding an active binding is
/// always let through; anything that would raise the active count is
/// checked against max_devices first.
pub fn admission_outcome(
    existing: Option<&DeviceBinding>,
    active_count: i64,
    max_devices: i32,
) -> Admission {
    if existing.is_some_and(|binding| binding.is_active) {
        return Admission::RefreshActive;
    }
    if active_count >= i64::from(max_devices) {
        return Admission::Reject;
    }
    if existing.is_some() {
        Admission::Reactivate
    } else {
        Admission::InsertNew
    }
}

/// Admits `device_id` for the key inside the caller's transaction.
/// Callers commit the binding even when a later gate rejects the
/// request; admission is a stage of its own, not part of the outcome.
pub async fn admit(
    conn: &mut PgConnection,
    key: &Key,
    device_id: &str,
    device_name: Option<&str>,
) -> Result<(), BrokerError> {
    let existing = sqlx::query_as::<_, DeviceBinding>(
        "SELECT * FROM device_bindings WHERE key_code = $1 AND device_id = $2",
    )
    .bind(&key.key_code)
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await?;

    let active_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM device_bindings WHERE key_code = $1 AND is_active = TRUE",
    )
    .bind(&key.key_code)
    .fetch_one(&mut *conn)
    .await?;

    match admission_outcome(existing.as_ref(), active_count, key.max_devices) {
        Admission::RefreshActive => {
            sqlx::query(
                "UPDATE device_bindings
                 SET last_active_at = NOW(),
                     request_count = request_count + 1,
                     device_name = COALESCE($3, device_name)
                 WHERE key_code = $1 AND device_id = $2",
            )
            .bind(&key.key_code)
            .bind(device_id)
            .bind(device_name)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        Admission::Reactivate => {
            sqlx::query(
                "UPDATE device_bindings
                 SET is_active = TRUE,
                     last_active_at = NOW(),
                     request_count = request_count + 1,
                     device_name = COALESCE($3, device_name)
                 WHERE key_code = $1 AND device_id = $2",
            )
            .bind(&key.key_code)
            .bind(device_id)
            .bind(device_name)
            .execute(&mut *conn)
            .await?;
            tracing::info!(key = %key.key_code, device = device_id, "Device binding reactivated");
            Ok(())
        }
        Admission::InsertNew => {
            sqlx::query(
                "INSERT INTO device_bindings
                     (key_code, device_id, device_name, first_bound_at, last_active_at, request_count, is_active)
                 VALUES ($1, $2, $3, NOW(), NOW(), 1, TRUE)",
            )
            .bind(&key.key_code)
            .bind(device_id)
            .bind(device_name)
            .execute(&mut *conn)
            .await?;
            tracing::info!(key = %key.key_code, device = device_id, "New device bound");
            Ok(())
        }
        Admission::Reject => Err(BrokerError::DeviceCapacityExceeded {
            max_devices: key.max_devices,
        }),
    }
}

/// Read-side device operations for the status and unbind endpoints.
#[derive(Clone)]
pub struct DeviceService {
    repo: DeviceRepository,
}

impl DeviceService {
    pub fn new(repo: DeviceRepository) -> Self {
        Self { repo }
    }

    pub async fn active_count(&self, key_code: &str) -> Result<i64, BrokerError> {
        Ok(self.repo.count_active(key_code).await?)
    }

    pub async fn unbind(&self, key_code: &str, device_id: &str) -> Result<bool, BrokerError> {
        let released = self.repo.unbind(key_code, device_id).await?;
        if released {
            tracing::info!(key = key_code, device = device_id, "Device unbound");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn binding(is_active: bool) -> DeviceBinding {
        DeviceBinding {
            id: 1,
            key_code: "K-TEST".to_string(),
            device_id: "dev-1".to_string(),
            device_name: None,
            first_bound_at: Utc::now(),
            last_active_at: Utc::now(),
            request_count: 4,
            is_active,
        }
    }

    #[test]
    fn active_binding_refreshes_even_at_capacity() {
        let existing = binding(true);
        assert_eq!(
            admission_outcome(Some(&existing), 3, 3),
            Admission::RefreshActive
        );
    }

    #[test]
    fn capacity_blocks_new_and_returning_devices() {
        let inactive = binding(false);
        assert_eq!(admission_outcome(Some(&inactive), 2, 2), Admission::Reject);
        assert_eq!(admission_outcome(None, 2, 2), Admission::Reject);
    }

    #[test]
    fn returning_device_reactivates_its_row() {
        let inactive = binding(false);
        assert_eq!(
            admission_outcome(Some(&inactive), 1, 2),
            Admission::Reactivate
        );
    }

    #[test]
    fn unknown_device_gets_a_fresh_row() {
        assert_eq!(admission_outcome(None, 0, 1), Admission::InsertNew);
    }
}
