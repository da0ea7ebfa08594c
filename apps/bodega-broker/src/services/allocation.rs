//! Account issuance.
//!
//! One request claims at most one account. Ordinary keys drain the
//! shared pool oldest-first; pro keys draw a random pro-flagged
//! account. A key is never handed the same email twice, enforced
//! against the append-only assignment log rather than the live account
//! rows, so resetting an account does not reopen it for old holders.
//!
//! Each attempt runs in its own transaction. Gate effects (device
//! admission, lazy activation or expiry, the stale sweep) are committed
//! even when the request ultimately fails, mirroring the pipeline: a
//! stage that passed stays passed.

use std::sync::Arc;

use bodega_db::models::account::Account;
use bodega_db::models::key::Key;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::services::device;
use crate::services::entitlement::{self, GateVerdict, KeyPolicy};
use crate::services::rotation::ActiveRosterAccess;
use crate::upstream::{ProvisionedSeat, SeatService, UpstreamError};

#[derive(Debug, Clone, Copy)]
pub struct DeviceClaim<'a> {
    pub device_id: &'a str,
    pub device_name: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct IssuedAccount {
    pub email: String,
    pub api_key: String,
    pub name: Option<String>,
    /// Present only for key types whose policy reveals the secret.
    pub password: Option<String>,
}

enum Attempt {
    Issued(IssuedAccount),
    /// The claimed account turned out dead and was retired; the caller
    /// should try again with a fresh candidate.
    BadAccount,
}

pub struct AllocationService {
    pool: PgPool,
    seat: Arc<dyn SeatService>,
    roster: Arc<dyn ActiveRosterAccess>,
    config: BrokerConfig,
}

impl AllocationService {
    pub fn new(
        pool: PgPool,
        seat: Arc<dyn SeatService>,
        roster: Arc<dyn ActiveRosterAccess>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            pool,
            seat,
            roster,
            config,
        }
    }

    /// Issues one account to the key, skipping over accounts whose
    /// stored credentials prove dead upstream. Retirement of a bad
    /// account commits before the next attempt, so it stays retired
    /// even if the overall request ends up failing.
    pub async fn issue(
        &self,
        key_code: &str,
        mut device: Option<DeviceClaim<'_>>,
        client_ip: Option<&str>,
    ) -> Result<IssuedAccount, BrokerError> {
        for _ in 0..self.config.allocate_attempts {
            // Admission only runs on the first attempt; retries reuse
            // the committed binding.
            match self.try_issue(key_code, device.take(), client_ip).await? {
                Attempt::Issued(issued) => return Ok(issued),
                Attempt::BadAccount => continue,
            }
        }
        Err(BrokerError::NoAccountAvailable {
            reason: "no working account available",
        })
    }

    async fn try_issue(
        &self,
        key_code: &str,
        device: Option<DeviceClaim<'_>>,
        client_ip: Option<&str>,
    ) -> Result<Attempt, BrokerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let key = entitlement::load_key_for_update(&mut *tx, key_code).await?;

        if let Some(claim) = device {
            device::admit(&mut *tx, &key, claim.device_id, claim.device_name).await?;
        }

        let key = match entitlement::advance_key(&mut *tx, key, now).await {
            Ok(GateVerdict::Pass(key)) => key,
            Ok(GateVerdict::Expired) => {
                tx.commit().await?;
                return Err(BrokerError::KeyExpired);
            }
            Err(err @ BrokerError::KeyDisabled) => {
                tx.commit().await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let policy = KeyPolicy::for_key(&key, &self.config)?;
        let fresh_day = match entitlement::check_allocation(&policy, &key, now) {
            Ok(fresh_day) => fresh_day,
            Err(err) => {
                tx.commit().await?;
                return Err(err);
            }
        };

        let from_pro_pool = policy.uses_pro_pool();

        // Pro keys tied to a rotation group are served the roster's
        // active credential instead of draining the pool. The rotation
        // controller decides which member that is; we only read it.
        if let Some(group_id) = key.roster_group_id.filter(|_| from_pro_pool) {
            let member = self
                .roster
                .active_member(group_id)
                .await
                .map_err(BrokerError::Internal)?;
            let Some(member) = member else {
                tx.commit().await?;
                return Err(BrokerError::NoAccountAvailable {
                    reason: "no active roster member",
                });
            };
            let api_key = match &member.api_key {
                Some(api_key) => api_key.clone(),
                None => match self.provision(&member.email, &member.password).await {
                    Ok(seat) => {
                        sqlx::query(
                            "UPDATE roster_members SET api_key = $1, updated_at = NOW() WHERE id = $2",
                        )
                        .bind(&seat.api_key)
                        .bind(member.id)
                        .execute(&mut *tx)
                        .await?;
                        seat.api_key
                    }
                    Err(err) => {
                        let invalid = matches!(err, UpstreamError::InvalidCredentials);
                        tracing::warn!(
                            member = %member.email,
                            error = %err,
                            "Roster credential provisioning failed"
                        );
                        tx.commit().await?;
                        return Err(BrokerError::UpstreamLoginFailed {
                            invalid_credentials: invalid,
                        });
                    }
                },
            };
            self.bump_key_counters(&mut *tx, &key, &policy, fresh_day, client_ip, now)
                .await?;
            tx.commit().await?;
            tracing::info!(key = %key.key_code, member = %member.email, "Active roster credential issued");
            return Ok(Attempt::Issued(IssuedAccount {
                email: member.email,
                api_key,
                name: member.name,
                password: None,
            }));
        }

        if !from_pro_pool {
            self.sweep_stale(&mut *tx, now).await?;
        }

        let Some(account) = claim_account(&mut *tx, key_code, from_pro_pool).await? else {
            let unissued: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM accounts WHERE status = 'unused' AND is_pro = $1",
            )
            .bind(from_pro_pool)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Err(BrokerError::NoAccountAvailable {
                reason: exhaustion_reason(unissued),
            });
        };

        let (api_key, name) = match &account.api_key {
            Some(existing) => (existing.clone(), account.name.clone()),
            None => {
                // Lazy provisioning: the claimed row stays locked while
                // we log in, so no concurrent request can grab it.
                match self.provision(&account.email, &account.password).await {
                    Ok(seat) => {
                        let name = seat.name.or_else(|| account.name.clone());
                        (seat.api_key, name)
                    }
                    Err(UpstreamError::InvalidCredentials) => {
                        sqlx::query("UPDATE accounts SET status = 'expired' WHERE id = $1")
                            .bind(account.id)
                            .execute(&mut *tx)
                            .await?;
                        tracing::warn!(
                            email = %account.email,
                            "Account credentials rejected upstream, retired"
                        );
                        tx.commit().await?;
                        return Ok(Attempt::BadAccount);
                    }
                    Err(err) => {
                        tracing::warn!(email = %account.email, error = %err, "Provisioning failed");
                        tx.commit().await?;
                        return Err(BrokerError::UpstreamLoginFailed {
                            invalid_credentials: false,
                        });
                    }
                }
            }
        };

        self.mark_issued(
            &mut *tx,
            &key,
            &account,
            &api_key,
            name.as_deref(),
            &policy,
            fresh_day,
            client_ip,
            now,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            key = %key.key_code,
            email = %account.email,
            pro = from_pro_pool,
            "Account issued"
        );

        Ok(Attempt::Issued(IssuedAccount {
            email: account.email.clone(),
            api_key,
            name,
            password: policy.reveals_secret().then(|| account.password.clone()),
        }))
    }

    async fn provision(&self, email: &str, password: &str) -> Result<ProvisionedSeat, UpstreamError> {
        let id_token = self.seat.password_login(email, password).await?;
        self.seat.register_seat(&id_token).await
    }

    /// Retires ordinary unused accounts older than the retention
    /// window. Pro accounts are curated by hand and never swept.
    async fn sweep_stale(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let cutoff = now - Duration::days(self.config.retention_days);
        let swept = sqlx::query(
            "UPDATE accounts SET status = 'expired'
             WHERE status = 'unused' AND is_pro = FALSE AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;
        if swept.rows_affected() > 0 {
            tracing::info!(count = swept.rows_affected(), "Swept stale unused accounts");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn mark_issued(
        &self,
        conn: &mut PgConnection,
        key: &Key,
        account: &Account,
        api_key: &str,
        name: Option<&str>,
        policy: &KeyPolicy,
        fresh_day: bool,
        client_ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            "UPDATE accounts
             SET status = 'used', assigned_at = $2, assigned_to_key = $3,
                 api_key = $4, name = COALESCE($5, name)
             WHERE id = $1",
        )
        .bind(account.id)
        .bind(now)
        .bind(&key.key_code)
        .bind(api_key)
        .bind(name)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO account_assignments (key_code, account_id, email, assigned_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&key.key_code)
        .bind(account.id)
        .bind(&account.email)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        self.bump_key_counters(conn, key, policy, fresh_day, client_ip, now)
            .await
    }

    /// Increments the key's issue counters inside the caller's
    /// transaction. Unlimited keys also maintain the daily counter and
    /// its reset date.
    async fn bump_key_counters(
        &self,
        conn: &mut PgConnection,
        key: &Key,
        policy: &KeyPolicy,
        fresh_day: bool,
        client_ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        if matches!(policy, KeyPolicy::Unlimited { .. }) {
            let daily = if fresh_day {
                1
            } else {
                key.daily_request_count + 1
            };
            sqlx::query(
                "UPDATE keys
                 SET request_count = request_count + 1, daily_request_count = $2,
                     last_reset_date = $3, last_request_at = $4,
                     last_request_ip = COALESCE($5, last_request_ip)
                 WHERE id = $1",
            )
            .bind(key.id)
            .bind(daily)
            .bind(now.date_naive())
            .bind(now)
            .bind(client_ip)
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query(
                "UPDATE keys
                 SET request_count = request_count + 1, last_request_at = $2,
                     last_request_ip = COALESCE($3, last_request_ip)
                 WHERE id = $1",
            )
            .bind(key.id)
            .bind(now)
            .bind(client_ip)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Status view: applies the lazy lifecycle step and returns the key
    /// as it now stands. Unlike the issue path this ignores the
    /// disabled flag, so holders of a disabled key can still see it.
    pub async fn inspect(&self, key_code: &str) -> Result<Key, BrokerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let key = entitlement::load_key_for_update(&mut *tx, key_code).await?;
        let key = entitlement::apply_lifecycle(&mut *tx, key, now).await?;
        tx.commit().await?;
        Ok(key)
    }
}

/// Claims one unused account for the key, skipping rows another
/// transaction is already claiming, and excluding emails this key has
/// held before. Ordinary keys take the oldest candidate, pro keys a
/// random one.
async fn claim_account(
    conn: &mut PgConnection,
    key_code: &str,
    from_pro_pool: bool,
) -> Result<Option<Account>, BrokerError> {
    let query = if from_pro_pool {
        "SELECT * FROM accounts
         WHERE status = 'unused' AND is_pro = TRUE
           AND NOT EXISTS (SELECT 1 FROM account_assignments aa
                           WHERE aa.key_code = $1 AND aa.email = accounts.email)
         ORDER BY RANDOM()
         LIMIT 1
         FOR UPDATE SKIP LOCKED"
    } else {
        "SELECT * FROM accounts
         WHERE status = 'unused' AND is_pro = FALSE
           AND NOT EXISTS (SELECT 1 FROM account_assignments aa
                           WHERE aa.key_code = $1 AND aa.email = accounts.email)
         ORDER BY created_at ASC
         LIMIT 1
         FOR UPDATE SKIP LOCKED"
    };
    Ok(sqlx::query_as::<_, Account>(query)
        .bind(key_code)
        .fetch_optional(&mut *conn)
        .await?)
}

/// When the claim finds nothing, the unused count in the same pool
/// tells the two exhaustion cases apart: accounts remain but the
/// assignment history excludes them all for this key, or the pool is
/// genuinely dry.
fn exhaustion_reason(unissued_in_pool: i64) -> &'static str {
    if unissued_in_pool > 0 {
        "all remaining accounts were already issued to this key"
    } else {
        "account pool is empty"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_exhaustion_reads_differently_from_a_dry_pool() {
        assert_eq!(
            exhaustion_reason(3),
            "all remaining accounts were already issued to this key"
        );
        assert_eq!(exhaustion_reason(0), "account pool is empty");
    }
}
