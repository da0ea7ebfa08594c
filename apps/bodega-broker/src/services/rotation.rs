//! Credit-based roster rotation for pro keys.
//!
//! Each rotation group keeps exactly one current member. The controller
//! runs opportunistically when a client asks for a swap: it checks the
//! member's remaining credit and, once it drops below the group
//! threshold, disables the member upstream, enables the next eligible
//! one and logs the switch. An exhausted member is never revisited.
//!
//! The group's current-member field is the only "active pro" pointer in
//! the system: this module writes it, the allocator reads it through
//! [`ActiveRosterAccess`].

use async_trait::async_trait;
use bodega_db::models::roster::{RosterGroup, RosterMember, SwitchRecord};
use bodega_db::repositories::roster_repo::RosterRepository;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::services::allocation::DeviceClaim;
use crate::services::device;
use crate::services::entitlement::{self, GateVerdict, KeyPolicy};
use crate::upstream::token;
use crate::upstream::{SeatService, UpstreamError};

/// Read side of the active-credential pointer. The rotation controller
/// is the only writer.
#[async_trait]
pub trait ActiveRosterAccess: Send + Sync {
    async fn active_member(&self, group_id: i64) -> anyhow::Result<Option<RosterMember>>;
}

#[async_trait]
impl ActiveRosterAccess for RosterRepository {
    async fn active_member(&self, group_id: i64) -> anyhow::Result<Option<RosterMember>> {
        self.current_member(group_id).await
    }
}

#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub switched: bool,
    pub email: String,
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub credits_remaining: Option<i64>,
}

pub struct RotationService {
    pool: PgPool,
    repo: RosterRepository,
    seat: Arc<dyn SeatService>,
    config: BrokerConfig,
}

impl RotationService {
    pub fn new(
        pool: PgPool,
        repo: RosterRepository,
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

    /// Client-facing swap request. Gates on the key like any other
    /// entitlement request, applies the per-key swap cooldown, then
    /// hands over to the rotation check. The cooldown stamp goes in
    /// the gate transaction, so concurrent swaps on one key serialize
    /// on the row lock.
    pub async fn swap(
        &self,
        key_code: &str,
        device: Option<DeviceClaim<'_>>,
    ) -> Result<SwapOutcome, BrokerError> {
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
        if !policy.uses_pro_pool() {
            tx.commit().await?;
            return Err(BrokerError::WrongKeyType);
        }
        if let Some(retry_after_secs) = entitlement::cooldown_remaining(
            key.last_pro_switch_at,
            self.config.swap_cooldown_secs,
            now,
        ) {
            tx.commit().await?;
            return Err(BrokerError::RateLimited { retry_after_secs });
        }
        sqlx::query("UPDATE keys SET last_pro_switch_at = $1 WHERE id = $2")
            .bind(now)
            .bind(key.id)
            .execute(&mut *tx)
            .await?;
        let group_id = key.roster_group_id;
        tx.commit().await?;

        let Some(group_id) = group_id else {
            return Err(BrokerError::RotationNoEligibleMember);
        };
        self.maybe_rotate(group_id, now).await
    }

    /// Checks the group's current member and switches when its credit
    /// has fallen below the threshold. Within the post-switch cooldown
    /// the credit check is skipped entirely.
    pub async fn maybe_rotate(
        &self,
        group_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SwapOutcome, BrokerError> {
        let Some(group) = self.repo.get_group(group_id).await? else {
            return Err(BrokerError::RotationNoEligibleMember);
        };

        let current = self.repo.current_member(group_id).await?;
        let Some(member) = current else {
            let members = self.repo.members_ordered(group_id).await?;
            let Some(next) = pick_next(&members, None).cloned() else {
                return Err(BrokerError::RotationNoEligibleMember);
            };
            return self
                .switch_to(&group, None, &next, None, "no current member", now)
                .await;
        };

        if entitlement::cooldown_remaining(
            group.last_switch_at,
            self.config.switch_cooldown_secs,
            now,
        )
        .is_some()
        {
            return Ok(standing(&member, Some(i64::from(member.last_credits))));
        }

        let (remaining, fresh) = self.resolve_credits(&group, &member, now).await;
        if fresh {
            self.repo
                .record_member_check(member.id, clamp_credits(remaining))
                .await?;
        }
        self.repo.record_group_check(group_id).await?;

        let (credits_before, reason) = match credit_verdict(remaining, group.credits_threshold) {
            CreditVerdict::Standing => return Ok(standing(&member, Some(remaining))),
            CreditVerdict::SwitchOut {
                credits_before,
                reason,
            } => (credits_before, reason),
        };

        tracing::info!(
            group = group.id,
            member = %member.email,
            credits = remaining,
            threshold = group.credits_threshold,
            "Credits below threshold, rotating"
        );
        let members = self.repo.members_ordered(group_id).await?;
        let Some(next) = pick_next(&members, Some(member.id)).cloned() else {
            return Err(BrokerError::RotationNoEligibleMember);
        };
        self.switch_to(&group, Some(&member), &next, Some(credits_before), &reason, now)
            .await
    }

    /// Remaining credit for the current member: the admin bulk query
    /// combined with the member's own plan lookup, then a member login
    /// as fallback, then the last recorded value. The boolean reports
    /// whether the value is fresh.
    async fn resolve_credits(
        &self,
        group: &RosterGroup,
        member: &RosterMember,
        now: DateTime<Utc>,
    ) -> (i64, bool) {
        match self.admin_credits(group, member, now).await {
            Ok(remaining) => (remaining, true),
            Err(admin_err) => {
                tracing::warn!(
                    group = group.id,
                    error = %admin_err,
                    "Admin credit path failed, trying member login"
                );
                match self.member_credits(member).await {
                    Ok(remaining) => (remaining, true),
                    Err(member_err) => {
                        tracing::warn!(
                            member = %member.email,
                            error = %member_err,
                            "Member credit path failed, keeping last known value"
                        );
                        (i64::from(member.last_credits), false)
                    }
                }
            }
        }
    }

    async fn admin_credits(
        &self,
        group: &RosterGroup,
        member: &RosterMember,
        now: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let admin_token = self.ensure_admin_token(group, now).await?;
        let usage = self.seat.member_usage(&admin_token).await?;
        let used = usage
            .iter()
            .find(|row| row.email.eq_ignore_ascii_case(&member.email))
            .map(|row| row.used_credits)
            .ok_or_else(|| anyhow::anyhow!("member {} absent from bulk usage", member.email))?;
        let member_token = member.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!("member {} has no api key for the quota lookup", member.email)
        })?;
        let plan = self.seat.plan_status(member_token).await?;
        let monthly = plan
            .monthly
            .ok_or_else(|| anyhow::anyhow!("plan status carried no monthly allotment"))?;
        Ok((monthly - used).max(0))
    }

    async fn member_credits(&self, member: &RosterMember) -> anyhow::Result<i64> {
        let token = self
            .seat
            .password_login(&member.email, &member.password)
            .await?;
        let snapshot = self.seat.profile_credits(&token).await?;
        snapshot
            .remaining
            .ok_or_else(|| anyhow::anyhow!("profile carried no remaining credit"))
    }

    /// Admin bearer token with local expiry peek: reused while it has
    /// more than the configured margin left, re-login otherwise.
    async fn ensure_admin_token(
        &self,
        group: &RosterGroup,
        now: DateTime<Utc>,
    ) -> Result<String, BrokerError> {
        match &group.admin_token {
            Some(token)
                if !token::needs_refresh(
                    Some(token),
                    now,
                    self.config.admin_token_margin_secs,
                ) =>
            {
                Ok(token.clone())
            }
            _ => {
                let token = self
                    .seat
                    .password_login(&group.admin_email, &group.admin_password)
                    .await
                    .map_err(|err| BrokerError::UpstreamLoginFailed {
                        invalid_credentials: matches!(err, UpstreamError::InvalidCredentials),
                    })?;
                self.repo.save_admin_token(group.id, &token).await?;
                tracing::info!(group = group.id, "Admin token refreshed");
                Ok(token)
            }
        }
    }

    async fn ensure_member_api_key(&self, member: &RosterMember) -> Result<String, BrokerError> {
        if let Some(api_key) = &member.api_key {
            return Ok(api_key.clone());
        }
        let id_token = self
            .seat
            .password_login(&member.email, &member.password)
            .await
            .map_err(|err| BrokerError::UpstreamLoginFailed {
                invalid_credentials: matches!(err, UpstreamError::InvalidCredentials),
            })?;
        let seat = self.seat.register_seat(&id_token).await.map_err(|err| {
            BrokerError::Internal(anyhow::anyhow!(
                "member registration failed for {}: {err}",
                member.email
            ))
        })?;
        self.repo.save_member_api_key(member.id, &seat.api_key).await?;
        Ok(seat.api_key)
    }

    /// Executes a switch: upstream toggles first, then one transaction
    /// for the member flags, the group pointer and the history row.
    async fn switch_to(
        &self,
        group: &RosterGroup,
        outgoing: Option<&RosterMember>,
        incoming: &RosterMember,
        credits_before: Option<i64>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SwapOutcome, BrokerError> {
        let admin_token = self.ensure_admin_token(group, now).await?;
        let incoming_key = self.ensure_member_api_key(incoming).await?;

        if let Some(outgoing) = outgoing {
            match outgoing.api_key.as_deref() {
                Some(outgoing_key) => {
                    self.seat
                        .set_access_disabled(&admin_token, outgoing_key, true)
                        .await
                        .map_err(|err| {
                            BrokerError::Internal(anyhow::anyhow!(
                                "failed to disable outgoing member {}: {err}",
                                outgoing.email
                            ))
                        })?;
                }
                None => tracing::warn!(
                    member = %outgoing.email,
                    "Outgoing member has no api key, skipping upstream disable"
                ),
            }
        }
        self.seat
            .set_access_disabled(&admin_token, &incoming_key, false)
            .await
            .map_err(|err| {
                BrokerError::Internal(anyhow::anyhow!(
                    "failed to enable incoming member {}: {err}",
                    incoming.email
                ))
            })?;

        let mut tx = self.pool.begin().await?;
        if let Some(outgoing) = outgoing {
            sqlx::query(
                "UPDATE roster_members
                 SET is_current = FALSE, is_enabled = FALSE, is_exhausted = TRUE,
                     disabled_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(outgoing.id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE roster_members
             SET is_current = TRUE, is_enabled = TRUE, enabled_at = NOW(), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(incoming.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE roster_groups
             SET current_member_id = $2, last_switch_at = NOW(),
                 switch_count = switch_count + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(group.id)
        .bind(incoming.id)
        .execute(&mut *tx)
        .await?;
        let record = sqlx::query_as::<_, SwitchRecord>(
            "INSERT INTO switch_history
                 (group_id, from_member_id, to_member_id, from_email, to_email, reason, credits_before, switched_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
             RETURNING *",
        )
        .bind(group.id)
        .bind(outgoing.map(|m| m.id))
        .bind(incoming.id)
        .bind(outgoing.map(|m| m.email.as_str()))
        .bind(&incoming.email)
        .bind(reason)
        .bind(credits_before.map(clamp_credits))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            switch = record.id,
            group = record.group_id,
            from = record.from_email.as_deref().unwrap_or("-"),
            to = %record.to_email,
            reason = %record.reason,
            "Roster member switched"
        );

        Ok(SwapOutcome {
            switched: true,
            email: incoming.email.clone(),
            name: incoming.name.clone(),
            api_key: Some(incoming_key),
            credits_remaining: None,
        })
    }
}

fn standing(member: &RosterMember, credits_remaining: Option<i64>) -> SwapOutcome {
    SwapOutcome {
        switched: false,
        email: member.email.clone(),
        name: member.name.clone(),
        api_key: member.api_key.clone(),
        credits_remaining,
    }
}

/// First member in roster order that is neither the current one, nor
/// exhausted, nor already enabled.
fn pick_next(members: &[RosterMember], current_id: Option<i64>) -> Option<&RosterMember> {
    members.iter().find(|m| {
        Some(m.id) != current_id && !m.is_current && !m.is_exhausted && !m.is_enabled
    })
}

#[derive(Debug, PartialEq, Eq)]
enum CreditVerdict {
    Standing,
    SwitchOut { credits_before: i64, reason: String },
}

/// Pure switch decision: the member stands at or above the threshold,
/// below it the verdict carries the observed credit and the reason for
/// the history row.
fn credit_verdict(remaining: i64, threshold: i32) -> CreditVerdict {
    if remaining >= i64::from(threshold) {
        CreditVerdict::Standing
    } else {
        CreditVerdict::SwitchOut {
            credits_before: remaining,
            reason: format!("credits {remaining} below threshold {threshold}"),
        }
    }
}

/// Credit columns are INTEGER while the upstream math runs in i64;
/// saturate into the column range instead of truncating.
fn clamp_credits(value: i64) -> i32 {
    value.clamp(0, i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, sort_order: i32) -> RosterMember {
        RosterMember {
            id,
            group_id: 1,
            email: format!("m{id}@example.com"),
            password: "pw".to_string(),
            api_key: None,
            name: None,
            is_enabled: false,
            is_current: false,
            is_exhausted: false,
            last_credits: 0,
            last_check_at: None,
            enabled_at: None,
            disabled_at: None,
            sort_order,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn picks_first_eligible_in_roster_order() {
        let mut current = member(1, 1);
        current.is_current = true;
        current.is_enabled = true;
        let mut exhausted = member(2, 2);
        exhausted.is_exhausted = true;
        let candidate = member(3, 3);
        let later = member(4, 4);

        let members = vec![current, exhausted, candidate, later];
        let picked = pick_next(&members, Some(1)).unwrap();
        assert_eq!(picked.id, 3);
    }

    #[test]
    fn exhausted_members_are_never_picked_again() {
        let mut a = member(1, 1);
        a.is_exhausted = true;
        let mut b = member(2, 2);
        b.is_exhausted = true;

        assert!(pick_next(&[a, b], None).is_none());
    }

    #[test]
    fn already_enabled_members_are_skipped() {
        let mut enabled = member(1, 1);
        enabled.is_enabled = true;
        let fresh = member(2, 2);

        let members = vec![enabled, fresh];
        assert_eq!(pick_next(&members, None).unwrap().id, 2);
    }

    #[test]
    fn standing_outcome_reports_current_member() {
        let mut m = member(7, 1);
        m.api_key = Some("sk-777".to_string());
        m.last_credits = 42;

        let outcome = standing(&m, Some(i64::from(m.last_credits)));
        assert!(!outcome.switched);
        assert_eq!(outcome.email, "m7@example.com");
        assert_eq!(outcome.credits_remaining, Some(42));
        assert_eq!(outcome.api_key.as_deref(), Some("sk-777"));
    }

    #[test]
    fn freshly_seeded_roster_has_an_eligible_member() {
        // Seeded members are disabled and non-current, the standby
        // state the picker selects from.
        let members = vec![member(1, 1), member(2, 2)];
        assert_eq!(pick_next(&members, None).unwrap().id, 1);
    }

    #[test]
    fn switches_below_threshold_with_observed_credits() {
        match credit_verdict(15, 20) {
            CreditVerdict::SwitchOut {
                credits_before,
                reason,
            } => {
                assert_eq!(credits_before, 15);
                assert_eq!(reason, "credits 15 below threshold 20");
            }
            CreditVerdict::Standing => panic!("member should be switched out"),
        }
    }

    #[test]
    fn stands_at_or_above_threshold() {
        assert_eq!(credit_verdict(20, 20), CreditVerdict::Standing);
        assert_eq!(credit_verdict(150, 20), CreditVerdict::Standing);
    }

    #[test]
    fn credit_clamp_saturates_into_column_range() {
        assert_eq!(clamp_credits(15), 15);
        assert_eq!(clamp_credits(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(clamp_credits(-3), 0);
    }
}
