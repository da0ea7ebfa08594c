use anyhow::Result;

#[derive(Clone)]
pub struct BrokerConfig {
    pub database_url: String,
    /// Base URL of the seat-management RPC endpoint.
    pub seat_api_base: String,
    /// Base URL of the seat registration endpoint.
    pub register_api_base: String,
    /// Identity-provider password login endpoint.
    pub identity_login_url: String,
    /// Team card exchange endpoint.
    pub card_exchange_url: String,
    pub listen_port: u16,
    pub http_timeout_secs: u64,
    /// Unclaimed ordinary accounts older than this are swept as stale.
    pub retention_days: i64,
    /// Daily issuance cap for unlimited keys.
    pub daily_cap: i64,
    /// Per-request cooldown for unlimited keys, in seconds.
    pub request_cooldown_secs: i64,
    /// Minimum gap between pro swap requests on one key.
    pub swap_cooldown_secs: i64,
    /// Minimum gap between roster switches in one group.
    pub switch_cooldown_secs: i64,
    /// How many bad accounts a single issue request may skip over.
    pub allocate_attempts: u32,
    pub team_cache_ttl_secs: i64,
    /// Refresh the admin token when it expires within this margin.
    pub admin_token_margin_secs: i64,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")?,
            seat_api_base: std::env::var("SEAT_API_BASE")?,
            register_api_base: std::env::var("REGISTER_API_BASE")?,
            identity_login_url: std::env::var("IDENTITY_LOGIN_URL")?,
            card_exchange_url: std::env::var("CARD_EXCHANGE_URL")?,
            listen_port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            retention_days: std::env::var("ACCOUNT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            daily_cap: std::env::var("UNLIMITED_DAILY_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            request_cooldown_secs: std::env::var("UNLIMITED_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            swap_cooldown_secs: std::env::var("PRO_SWAP_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            switch_cooldown_secs: std::env::var("ROSTER_SWITCH_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            allocate_attempts: std::env::var("ALLOCATE_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            team_cache_ttl_secs: std::env::var("TEAM_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            admin_token_margin_secs: std::env::var("ADMIN_TOKEN_MARGIN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        })
    }
}
