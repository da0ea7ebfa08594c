use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bodega_wire::encode;
use thiserror::Error;

use crate::config::BrokerConfig;

use super::credits::{
    CreditSnapshot, MemberUsage, parse_member_usage, parse_plan_status, parse_profile,
};

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The identity provider rejected the email/password pair itself.
    /// Anything else (timeouts, 5xx, quota blocks) is `Request`.
    #[error("upstream rejected the credentials")]
    InvalidCredentials,

    #[error("upstream request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionedSeat {
    pub api_key: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TeamLoginDescriptor {
    pub callback_url: String,
    pub email: Option<String>,
    pub nickname: Option<String>,
}

/// Outbound surface towards the seat-management service and its
/// identity provider. Kept as a trait so the allocation and rotation
/// services can be exercised against a scripted implementation.
#[async_trait]
pub trait SeatService: Send + Sync {
    /// Email/password login, returns a short-lived bearer token.
    async fn password_login(&self, email: &str, password: &str) -> Result<String, UpstreamError>;

    /// Exchanges a one-time identity token for a long-lived seat key.
    async fn register_seat(&self, id_token: &str) -> Result<ProvisionedSeat, UpstreamError>;

    /// Toggles a member's access using the group admin's token.
    async fn set_access_disabled(
        &self,
        admin_token: &str,
        member_api_key: &str,
        disable: bool,
    ) -> Result<(), UpstreamError>;

    /// Lists the team's members with their per-member usage.
    async fn member_usage(&self, admin_token: &str) -> Result<Vec<MemberUsage>, UpstreamError>;

    async fn plan_status(&self, bearer: &str) -> Result<CreditSnapshot, UpstreamError>;

    async fn profile_credits(&self, bearer: &str) -> Result<CreditSnapshot, UpstreamError>;

    /// Trades a team card key for a one-time login descriptor.
    async fn exchange_team_card(
        &self,
        card_key: &str,
    ) -> Result<TeamLoginDescriptor, UpstreamError>;
}

pub struct HttpSeatService {
    client: reqwest::Client,
    seat_base: String,
    register_base: String,
    identity_login_url: String,
    card_exchange_url: String,
}

impl HttpSeatService {
    pub fn new(config: &BrokerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            seat_base: config.seat_api_base.trim_end_matches('/').to_string(),
            register_base: config.register_api_base.trim_end_matches('/').to_string(),
            identity_login_url: config.identity_login_url.clone(),
            card_exchange_url: config.card_exchange_url.clone(),
        })
    }

    fn rpc_url(base: &str, method: &str) -> String {
        format!("{base}/seat.SeatManagementService/{method}")
    }

    async fn post_proto(
        &self,
        method: &str,
        token: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, UpstreamError> {
        let url = Self::rpc_url(&self.seat_base, method);
        let response = self
            .client
            .post(&url)
            .header("accept", "*/*")
            .header("connect-protocol-version", "1")
            .header("content-type", "application/proto")
            .header("x-auth-token", token)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Request(format!(
                "{method} returned HTTP {status}: {text}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Identity-provider error codes that mean the credentials themselves
/// are bad. Matched as prefixes because the provider appends detail
/// after a colon on some of them.
fn is_credential_error(message: &str) -> bool {
    [
        "INVALID_PASSWORD",
        "EMAIL_NOT_FOUND",
        "INVALID_LOGIN_CREDENTIALS",
        "USER_DISABLED",
    ]
    .iter()
    .any(|code| message.starts_with(code))
}

#[async_trait]
impl SeatService for HttpSeatService {
    async fn password_login(&self, email: &str, password: &str) -> Result<String, UpstreamError> {
        let payload = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });
        let response = self
            .client
            .post(&self.identity_login_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("HTTP {status}"));
            if is_credential_error(&message) {
                return Err(UpstreamError::InvalidCredentials);
            }
            return Err(UpstreamError::Request(format!("login failed: {message}")));
        }

        let body: serde_json::Value = response.json().await?;
        body["idToken"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| UpstreamError::Request("login response missing idToken".into()))
    }

    async fn register_seat(&self, id_token: &str) -> Result<ProvisionedSeat, UpstreamError> {
        let url = Self::rpc_url(&self.register_base, "RegisterUser");
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "id_token": id_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Request(format!(
                "registration returned HTTP {status}: {text}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let api_key = body["apiKey"]
            .as_str()
            .or_else(|| body["api_key"].as_str())
            .map(|k| k.trim().to_owned())
            .ok_or_else(|| UpstreamError::Request("registration response missing api key".into()))?;
        let name = body["name"].as_str().map(str::to_owned);
        Ok(ProvisionedSeat { api_key, name })
    }

    async fn set_access_disabled(
        &self,
        admin_token: &str,
        member_api_key: &str,
        disable: bool,
    ) -> Result<(), UpstreamError> {
        let mut body = Vec::new();
        encode::put_text_field(&mut body, 1, admin_token);
        encode::put_text_field(&mut body, 2, member_api_key);
        encode::put_bool_field(&mut body, 3, disable);
        self.post_proto("UpdateSeatAccess", admin_token, body)
            .await?;
        Ok(())
    }

    async fn member_usage(&self, admin_token: &str) -> Result<Vec<MemberUsage>, UpstreamError> {
        let mut body = Vec::new();
        encode::put_text_field(&mut body, 1, admin_token);
        let bytes = self.post_proto("GetUsers", admin_token, body).await?;
        Ok(parse_member_usage(&bytes))
    }

    async fn plan_status(&self, bearer: &str) -> Result<CreditSnapshot, UpstreamError> {
        let mut body = Vec::new();
        encode::put_text_field(&mut body, 1, bearer);
        let bytes = self.post_proto("GetPlanStatus", bearer, body).await?;
        Ok(parse_plan_status(&bytes))
    }

    async fn profile_credits(&self, bearer: &str) -> Result<CreditSnapshot, UpstreamError> {
        let mut body = Vec::new();
        encode::put_text_field(&mut body, 1, bearer);
        encode::put_bool_field(&mut body, 2, true);
        encode::put_bool_field(&mut body, 3, true);
        encode::put_bool_field(&mut body, 4, true);
        let bytes = self.post_proto("GetCurrentUser", bearer, body).await?;
        Ok(parse_profile(&bytes))
    }

    async fn exchange_team_card(
        &self,
        card_key: &str,
    ) -> Result<TeamLoginDescriptor, UpstreamError> {
        let response = self
            .client
            .post(&self.card_exchange_url)
            .json(&serde_json::json!({ "card_key": card_key }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Request(format!(
                "card exchange returned HTTP {status}: {text}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let callback_url = body["callback_url"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                UpstreamError::Request("card exchange response missing callback_url".into())
            })?;
        Ok(TeamLoginDescriptor {
            callback_url,
            email: body["email"].as_str().map(str::to_owned),
            nickname: body["nickname"].as_str().map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_are_recognized_by_prefix() {
        assert!(is_credential_error("INVALID_PASSWORD"));
        assert!(is_credential_error("EMAIL_NOT_FOUND"));
        assert!(is_credential_error(
            "INVALID_LOGIN_CREDENTIALS : retry not allowed"
        ));
        assert!(is_credential_error("USER_DISABLED"));
    }

    #[test]
    fn transient_errors_are_not_credential_errors() {
        assert!(!is_credential_error("TOO_MANY_ATTEMPTS_TRY_LATER"));
        assert!(!is_credential_error("HTTP 503"));
        assert!(!is_credential_error(""));
    }

    #[test]
    fn rpc_urls_join_base_and_method() {
        assert_eq!(
            HttpSeatService::rpc_url("https://api.example.com", "GetUsers"),
            "https://api.example.com/seat.SeatManagementService/GetUsers"
        );
    }
}
