use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::roster::{RosterGroup, RosterMember};

#[derive(Clone, Debug)]
pub struct RosterRepository {
    pool: PgPool,
}

impl RosterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_group(&self, id: i64) -> Result<Option<RosterGroup>> {
        sqlx::query_as::<_, RosterGroup>("SELECT * FROM roster_groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch roster group")
    }

    pub async fn current_member(&self, group_id: i64) -> Result<Option<RosterMember>> {
        sqlx::query_as::<_, RosterMember>(
            "SELECT * FROM roster_members WHERE group_id = $1 AND is_current = TRUE LIMIT 1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch current roster member")
    }

    pub async fn members_ordered(&self, group_id: i64) -> Result<Vec<RosterMember>> {
        sqlx::query_as::<_, RosterMember>(
            "SELECT * FROM roster_members WHERE group_id = $1 ORDER BY sort_order ASC, id ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch roster members")
    }

    pub async fn save_admin_token(&self, group_id: i64, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE roster_groups SET admin_token = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(token)
        .bind(group_id)
        .execute(&self.pool)
        .await
        .context("Failed to save admin token")?;
        Ok(())
    }

    pub async fn save_member_api_key(&self, member_id: i64, api_key: &str) -> Result<()> {
        sqlx::query("UPDATE roster_members SET api_key = $1, updated_at = NOW() WHERE id = $2")
            .bind(api_key)
            .bind(member_id)
            .execute(&self.pool)
            .await
            .context("Failed to save member api key")?;
        Ok(())
    }

    pub async fn record_member_check(&self, member_id: i64, credits: i32) -> Result<()> {
        sqlx::query(
            "UPDATE roster_members
             SET last_credits = $1, last_check_at = NOW(), updated_at = NOW()
             WHERE id = $2",
        )
        .bind(credits)
        .bind(member_id)
        .execute(&self.pool)
        .await
        .context("Failed to record member credit check")?;
        Ok(())
    }

    pub async fn record_group_check(&self, group_id: i64) -> Result<()> {
        sqlx::query("UPDATE roster_groups SET last_check_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .context("Failed to record group credit check")?;
        Ok(())
    }
}
