use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::team::TeamLoginCache;

#[derive(Clone, Debug)]
pub struct TeamLoginRepository {
    pool: PgPool,
}

impl TeamLoginRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_key(&self, key_code: &str) -> Result<Option<TeamLoginCache>> {
        sqlx::query_as::<_, TeamLoginCache>(
            "SELECT * FROM team_login_cache WHERE key_code = $1",
        )
        .bind(key_code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch team login cache")
    }

    pub async fn upsert(
        &self,
        key_code: &str,
        team_card_key: &str,
        callback_url: &str,
        email: &str,
        nickname: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<TeamLoginCache> {
        sqlx::query_as::<_, TeamLoginCache>(
            r#"
            INSERT INTO team_login_cache (key_code, team_card_key, callback_url, email, nickname, cached_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6)
            ON CONFLICT (key_code) DO UPDATE SET
                team_card_key = EXCLUDED.team_card_key,
                callback_url = EXCLUDED.callback_url,
                email = EXCLUDED.email,
                nickname = EXCLUDED.nickname,
                cached_at = NOW(),
                expires_at = EXCLUDED.expires_at
            RETURNING *
            "#,
        )
        .bind(key_code)
        .bind(team_card_key)
        .bind(callback_url)
        .bind(email)
        .bind(nickname)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert team login cache")
    }
}
