//! Team key login delegation.
//!
//! Team keys carry no entitlement of their own: the card key stored on
//! the key is traded upstream for a one-time login descriptor, which is
//! cached with a short TTL so repeated logins within the window reuse
//! the same descriptor instead of burning another exchange.

use std::sync::Arc;

use bodega_db::repositories::team_repo::TeamLoginRepository;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::services::allocation::DeviceClaim;
use crate::services::device;
use crate::services::entitlement::{self, GateVerdict};
use crate::upstream::SeatService;

#[derive(Debug, Clone)]
pub struct TeamLogin {
    pub callback_url: String,
    pub email: String,
    pub nickname: Option<String>,
    pub cached: bool,
    pub expires_at: DateTime<Utc>,
}

pub struct TeamAccessService {
    pool: PgPool,
    repo: TeamLoginRepository,
    seat: Arc<dyn SeatService>,
    config: BrokerConfig,
}

impl TeamAccessService {
    pub fn new(
        pool: PgPool,
        repo: TeamLoginRepository,
        seat: Arc<dyn SeatService>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            pool,
            repo,
            seat,
            config,
        }
    }

    /// Serves the cached descriptor while it is fresh and was issued
    /// for the key's current card; otherwise exchanges the card anew.
    /// An exchange failure propagates rather than reviving a stale row.
    pub async fn login(
        &self,
        key_code: &str,
        device: Option<DeviceClaim<'_>>,
    ) -> Result<TeamLogin, BrokerError> {
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
        if key.key_type != "team" {
            tx.commit().await?;
            return Err(BrokerError::WrongKeyType);
        }
        let Some(card_key) = key.team_card_key.clone() else {
            tx.commit().await?;
            return Err(BrokerError::Internal(anyhow::anyhow!(
                "team key {} has no card key configured",
                key.key_code
            )));
        };
        tx.commit().await?;

        if let Some(cached) = self.repo.get_by_key(key_code).await? {
            if cached.is_fresh(now) && cached.team_card_key == card_key {
                return Ok(TeamLogin {
                    callback_url: cached.callback_url,
                    email: cached.email,
                    nickname: cached.nickname,
                    cached: true,
                    expires_at: cached.expires_at,
                });
            }
        }

        let descriptor = self.seat.exchange_team_card(&card_key).await.map_err(|err| {
            tracing::warn!(key = key_code, error = %err, "Team card exchange failed");
            BrokerError::UpstreamLoginFailed {
                invalid_credentials: false,
            }
        })?;

        let expires_at = now + Duration::seconds(self.config.team_cache_ttl_secs);
        let row = self
            .repo
            .upsert(
                key_code,
                &card_key,
                &descriptor.callback_url,
                descriptor.email.as_deref().unwrap_or(""),
                descriptor.nickname.as_deref(),
                expires_at,
            )
            .await?;
        tracing::info!(key = key_code, "Team login descriptor refreshed");

        Ok(TeamLogin {
            callback_url: row.callback_url,
            email: row.email,
            nickname: row.nickname,
            cached: false,
            expires_at: row.expires_at,
        })
    }
}
