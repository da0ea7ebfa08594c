//! Key lifecycle and per-type entitlement checks.
//!
//! Keys move inactive -> active -> expired, always lazily: the state
//! only advances while a request is being served. `is_disabled` is an
//! orthogonal flag checked before any transition, so a key can sit
//! disabled in any state and resume where it left off.

use bodega_db::models::key::Key;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::PgConnection;

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// What a key of each type is entitled to per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    Unlimited { daily_cap: i64, cooldown_secs: i64 },
    Limited { quota: i32 },
    Pro { quota: i32 },
    Team,
}

impl KeyPolicy {
    pub fn for_key(key: &Key, config: &BrokerConfig) -> Result<Self, BrokerError> {
        match key.key_type.as_str() {
            "unlimited" => Ok(Self::Unlimited {
                daily_cap: config.daily_cap,
                cooldown_secs: config.request_cooldown_secs,
            }),
            "limited" => Ok(Self::Limited {
                quota: key.account_limit,
            }),
            "pro" => Ok(Self::Pro {
                quota: key.account_limit,
            }),
            "team" => Ok(Self::Team),
            other => Err(BrokerError::Internal(anyhow::anyhow!(
                "key {} has unknown type {other:?}",
                key.key_code
            ))),
        }
    }

    /// Only limited keys hand the account password to the caller.
    pub fn reveals_secret(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    pub fn uses_pro_pool(&self) -> bool {
        matches!(self, Self::Pro { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Activate { expires_at: DateTime<Utc> },
    Expire,
}

/// The lazy lifecycle step due at `now`, if any. First use activates
/// and stamps the expiry from the grant duration; a passed expiry
/// moves the key to its terminal state.
pub fn lifecycle_action(key: &Key, now: DateTime<Utc>) -> Option<LifecycleAction> {
    match key.status.as_str() {
        "inactive" => Some(LifecycleAction::Activate {
            expires_at: now + key.grant_duration(),
        }),
        "active" if key.is_expired_at(now) => Some(LifecycleAction::Expire),
        _ => None,
    }
}

pub enum GateVerdict {
    Pass(Key),
    Expired,
}

pub async fn load_key_for_update(
    conn: &mut PgConnection,
    key_code: &str,
) -> Result<Key, BrokerError> {
    sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE key_code = $1 FOR UPDATE")
        .bind(key_code)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(BrokerError::InvalidKey)
}

/// Persists the pending lifecycle step inside the caller's transaction
/// and returns the key as it now stands. Ignores the disabled flag;
/// that belongs to the request gate, not the state machine.
pub async fn apply_lifecycle(
    conn: &mut PgConnection,
    key: Key,
    now: DateTime<Utc>,
) -> Result<Key, BrokerError> {
    match lifecycle_action(&key, now) {
        Some(LifecycleAction::Activate { expires_at }) => {
            sqlx::query(
                "UPDATE keys SET status = 'active', activated_at = $1, expires_at = $2 WHERE id = $3",
            )
            .bind(now)
            .bind(expires_at)
            .bind(key.id)
            .execute(&mut *conn)
            .await?;
            tracing::info!(key = %key.key_code, %expires_at, "Key activated on first use");
            Ok(Key {
                status: "active".to_string(),
                activated_at: Some(now),
                expires_at: Some(expires_at),
                ..key
            })
        }
        Some(LifecycleAction::Expire) => {
            sqlx::query("UPDATE keys SET status = 'expired' WHERE id = $1")
                .bind(key.id)
                .execute(&mut *conn)
                .await?;
            tracing::info!(key = %key.key_code, "Key expired");
            Ok(Key {
                status: "expired".to_string(),
                ..key
            })
        }
        None => Ok(key),
    }
}

/// Request-time gate: rejects disabled keys, applies the lazy
/// transition, and reports expiry as a verdict rather than an error so
/// the caller can commit the persisted transition before failing.
pub async fn advance_key(
    conn: &mut PgConnection,
    key: Key,
    now: DateTime<Utc>,
) -> Result<GateVerdict, BrokerError> {
    if key.is_disabled {
        return Err(BrokerError::KeyDisabled);
    }
    let key = apply_lifecycle(conn, key, now).await?;
    match key.status.as_str() {
        "active" => Ok(GateVerdict::Pass(key)),
        "expired" => Ok(GateVerdict::Expired),
        other => Err(BrokerError::Internal(anyhow::anyhow!(
            "key {} in unknown status {other:?}",
            key.key_code
        ))),
    }
}

/// Entitlement check for an account issue request. Returns whether the
/// unlimited daily counter starts a fresh day, which the caller needs
/// when bumping counters.
pub fn check_allocation(
    policy: &KeyPolicy,
    key: &Key,
    now: DateTime<Utc>,
) -> Result<bool, BrokerError> {
    match policy {
        KeyPolicy::Unlimited {
            daily_cap,
            cooldown_secs,
        } => {
            let fresh_day = key.last_reset_date != Some(now.date_naive());
            let count_today = if fresh_day {
                0
            } else {
                i64::from(key.daily_request_count)
            };
            if count_today >= *daily_cap {
                return Err(BrokerError::RateLimited {
                    retry_after_secs: secs_to_next_utc_midnight(now),
                });
            }
            if let Some(retry_after_secs) =
                cooldown_remaining(key.last_request_at, *cooldown_secs, now)
            {
                return Err(BrokerError::RateLimited { retry_after_secs });
            }
            Ok(fresh_day)
        }
        KeyPolicy::Limited { quota } | KeyPolicy::Pro { quota } => {
            if *quota == 0 {
                return Err(BrokerError::QuotaExhausted);
            }
            if *quota > 0 && key.request_count >= i64::from(*quota) {
                return Err(BrokerError::QuotaExhausted);
            }
            Ok(false)
        }
        KeyPolicy::Team => Err(BrokerError::WrongKeyType),
    }
}

/// Seconds left on a cooldown window, rounded up, or `None` once it has
/// passed.
pub fn cooldown_remaining(
    last: Option<DateTime<Utc>>,
    cooldown_secs: i64,
    now: DateTime<Utc>,
) -> Option<i64> {
    let last = last?;
    if cooldown_secs <= 0 {
        return None;
    }
    let waited_ms = (now - last).num_milliseconds();
    let need_ms = cooldown_secs * 1000;
    if waited_ms >= need_ms {
        None
    } else {
        Some((need_ms - waited_ms + 999) / 1000)
    }
}

/// The daily counter resets at UTC midnight regardless of server
/// timezone.
fn secs_to_next_utc_midnight(now: DateTime<Utc>) -> i64 {
    now.date_naive()
        .succ_opt()
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
        .map(|midnight| ((midnight - now).num_milliseconds() + 999) / 1000)
        .unwrap_or(86_400)
}

/// Human-readable validity left on a key, as shown by the status
/// endpoint.
pub fn format_remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(expires_at) = expires_at else {
        return "not activated".to_string();
    };
    if expires_at <= now {
        return "expired".to_string();
    }
    let left = expires_at - now;
    let days = left.num_days();
    let hours = left.num_hours() % 24;
    let minutes = left.num_minutes() % 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_key(key_type: &str) -> Key {
        Key {
            id: 1,
            key_code: "K-TEST".to_string(),
            key_type: key_type.to_string(),
            duration_days: 30,
            duration_hours: 0,
            status: "inactive".to_string(),
            is_disabled: false,
            created_at: Utc::now(),
            activated_at: None,
            expires_at: None,
            request_count: 0,
            daily_request_count: 0,
            last_reset_date: None,
            last_request_at: None,
            last_request_ip: None,
            account_limit: -1,
            max_devices: 1,
            team_card_key: None,
            roster_group_id: None,
            last_pro_switch_at: None,
            notes: None,
        }
    }

    fn unlimited() -> KeyPolicy {
        KeyPolicy::Unlimited {
            daily_cap: 20,
            cooldown_secs: 300,
        }
    }

    #[test]
    fn first_use_activates_with_grant_duration() {
        let mut key = base_key("unlimited");
        key.duration_days = 1;
        key.duration_hours = 6;
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();

        match lifecycle_action(&key, now) {
            Some(LifecycleAction::Activate { expires_at }) => {
                assert_eq!(expires_at, now + Duration::days(1) + Duration::hours(6));
            }
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[test]
    fn passed_expiry_triggers_lazy_expire() {
        let now = Utc::now();
        let mut key = base_key("limited");
        key.status = "active".to_string();
        key.expires_at = Some(now - Duration::seconds(1));

        assert_eq!(lifecycle_action(&key, now), Some(LifecycleAction::Expire));
    }

    #[test]
    fn active_key_within_window_needs_no_action() {
        let now = Utc::now();
        let mut key = base_key("limited");
        key.status = "active".to_string();
        key.expires_at = Some(now + Duration::days(3));

        assert_eq!(lifecycle_action(&key, now), None);
    }

    #[test]
    fn expired_is_terminal() {
        let mut key = base_key("limited");
        key.status = "expired".to_string();
        key.expires_at = Some(Utc::now() + Duration::days(30));

        assert_eq!(lifecycle_action(&key, Utc::now()), None);
    }

    #[test]
    fn daily_cap_rejects_until_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
        let mut key = base_key("unlimited");
        key.last_reset_date = Some(now.date_naive());
        key.daily_request_count = 20;

        match check_allocation(&unlimited(), &key, now) {
            Err(BrokerError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 3600);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn stale_reset_date_starts_a_fresh_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap();
        let mut key = base_key("unlimited");
        key.last_reset_date = now.date_naive().pred_opt();
        key.daily_request_count = 20;

        assert!(check_allocation(&unlimited(), &key, now).unwrap());
    }

    #[test]
    fn cooldown_reports_ceiled_seconds_left() {
        let now = Utc::now();
        let last = now - Duration::milliseconds(100_500);
        assert_eq!(cooldown_remaining(Some(last), 300, now), Some(200));
        assert_eq!(cooldown_remaining(Some(now - Duration::seconds(300)), 300, now), None);
        assert_eq!(cooldown_remaining(None, 300, now), None);
    }

    #[test]
    fn cooldown_applies_to_unlimited_requests() {
        let now = Utc::now();
        let mut key = base_key("unlimited");
        key.last_reset_date = Some(now.date_naive());
        key.daily_request_count = 3;
        key.last_request_at = Some(now - Duration::seconds(10));

        match check_allocation(&unlimited(), &key, now) {
            Err(BrokerError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 290);
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
    }

    #[test]
    fn zero_quota_is_exhausted_outright() {
        let mut key = base_key("limited");
        key.account_limit = 0;
        let policy = KeyPolicy::Limited { quota: 0 };

        assert!(matches!(
            check_allocation(&policy, &key, Utc::now()),
            Err(BrokerError::QuotaExhausted)
        ));
    }

    #[test]
    fn positive_quota_caps_total_requests() {
        let mut key = base_key("limited");
        key.request_count = 5;
        let policy = KeyPolicy::Limited { quota: 5 };

        assert!(matches!(
            check_allocation(&policy, &key, Utc::now()),
            Err(BrokerError::QuotaExhausted)
        ));

        key.request_count = 4;
        assert!(!check_allocation(&policy, &key, Utc::now()).unwrap());
    }

    #[test]
    fn negative_quota_is_unbounded() {
        let mut key = base_key("pro");
        key.request_count = 100_000;
        let policy = KeyPolicy::Pro { quota: -1 };

        assert!(check_allocation(&policy, &key, Utc::now()).is_ok());
    }

    #[test]
    fn team_keys_cannot_draw_accounts() {
        let key = base_key("team");
        assert!(matches!(
            check_allocation(&KeyPolicy::Team, &key, Utc::now()),
            Err(BrokerError::WrongKeyType)
        ));
    }

    #[test]
    fn remaining_time_formats_by_magnitude() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(format_remaining(None, now), "not activated");
        assert_eq!(format_remaining(Some(now - Duration::seconds(1)), now), "expired");
        assert_eq!(
            format_remaining(Some(now + Duration::days(3) + Duration::hours(4)), now),
            "3d4h"
        );
        assert_eq!(
            format_remaining(
                Some(now + Duration::hours(4) + Duration::minutes(30)),
                now
            ),
            "4h30m"
        );
        assert_eq!(format_remaining(Some(now + Duration::minutes(12)), now), "12m");
        assert_eq!(format_remaining(Some(now + Duration::seconds(30)), now), "0m");
    }

    #[test]
    fn policy_mapping_follows_key_type() {
        let config = test_config();
        let key = base_key("limited");
        assert_eq!(
            KeyPolicy::for_key(&key, &config).unwrap(),
            KeyPolicy::Limited { quota: -1 }
        );
        assert!(KeyPolicy::for_key(&base_key("weekly"), &config).is_err());
        assert!(KeyPolicy::for_key(&base_key("team"), &config).unwrap() == KeyPolicy::Team);
        assert!(
            KeyPolicy::for_key(&base_key("limited"), &config)
                .unwrap()
                .reveals_secret()
        );
        assert!(
            !KeyPolicy::for_key(&base_key("pro"), &config)
                .unwrap()
                .reveals_secret()
        );
    }

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            database_url: String::new(),
            seat_api_base: String::new(),
            register_api_base: String::new(),
            identity_login_url: String::new(),
            card_exchange_url: String::new(),
            listen_port: 0,
            http_timeout_secs: 30,
            retention_days: 6,
            daily_cap: 20,
            request_cooldown_secs: 300,
            swap_cooldown_secs: 30,
            switch_cooldown_secs: 60,
            allocate_attempts: 5,
            team_cache_ttl_secs: 600,
            admin_token_margin_secs: 300,
        }
    }
}
