use crate::AppState;
use crate::error::BrokerError;
use crate::services::allocation::DeviceClaim;
use crate::services::entitlement;
use axum::{Json, extract::State, http::HeaderMap};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

/// Bearer key from the `x-api-key` header. Absent or blank reads the
/// same as an unknown key, so callers cannot tell the two apart.
fn require_key(headers: &HeaderMap) -> Result<&str, BrokerError> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(BrokerError::InvalidKey)
}

fn device_claim(headers: &HeaderMap) -> Option<DeviceClaim<'_>> {
    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let device_name = headers
        .get("x-device-name")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    Some(DeviceClaim {
        device_id,
        device_name,
    })
}

fn get_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(ip) = headers.get("cf-connecting-ip") {
        return ip.to_str().ok().map(|s| s.to_string());
    }
    if let Some(ip) = headers.get("x-forwarded-for") {
        return ip
            .to_str()
            .ok()
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string());
    }
    None
}

pub async fn issue_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let key_code = require_key(&headers)?;
    let device = device_claim(&headers);
    let client_ip = get_client_ip(&headers);

    info!(
        "Account request: key={}, device={:?}, IP={}",
        key_code,
        device.as_ref().map(|d| d.device_id),
        client_ip.as_deref().unwrap_or("unknown")
    );

    let issued = state
        .allocation
        .issue(key_code, device, client_ip.as_deref())
        .await?;

    let mut body = json!({
        "email": issued.email,
        "api_key": issued.api_key,
        "name": issued.name,
    });
    if let Some(password) = issued.password {
        body["password"] = json!(password);
    }
    Ok(Json(body))
}

pub async fn key_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let key_code = require_key(&headers)?;

    let key = state.allocation.inspect(key_code).await?;
    let active_devices = state.devices.active_count(&key.key_code).await?;

    // -1 marks an uncapped key, mirroring account_limit <= 0.
    let remaining_accounts = if key.account_limit > 0 {
        (i64::from(key.account_limit) - key.request_count).max(0)
    } else {
        -1
    };

    Ok(Json(json!({
        "key_type": key.key_type,
        "status": key.status,
        "is_disabled": key.is_disabled,
        "remaining_time": entitlement::format_remaining(key.expires_at, Utc::now()),
        "activated_at": key.activated_at,
        "expires_at": key.expires_at,
        "request_count": key.request_count,
        "account_limit": key.account_limit,
        "remaining_accounts": remaining_accounts,
        "max_devices": key.max_devices,
        "active_devices": active_devices,
    })))
}

pub async fn swap_pro(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let key_code = require_key(&headers)?;
    let device = device_claim(&headers);

    let outcome = state.rotation.swap(key_code, device).await?;

    Ok(Json(json!({
        "switched": outcome.switched,
        "email": outcome.email,
        "name": outcome.name,
        "api_key": outcome.api_key,
        "credits_remaining": outcome.credits_remaining,
    })))
}

pub async fn team_login(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let key_code = require_key(&headers)?;
    let device = device_claim(&headers);

    let login = state.team.login(key_code, device).await?;

    Ok(Json(json!({
        "callback_url": login.callback_url,
        "email": login.email,
        "nickname": login.nickname,
        "cached": login.cached,
        "expires_at": login.expires_at,
    })))
}

#[derive(Deserialize)]
pub struct UnbindRequest {
    pub device_id: String,
}

pub async fn unbind_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UnbindRequest>,
) -> Result<Json<Value>, BrokerError> {
    let key_code = require_key(&headers)?;

    // Validates the key (and settles any pending lifecycle change)
    // before touching bindings.
    let key = state.allocation.inspect(key_code).await?;
    let released = state.devices.unbind(&key.key_code, &req.device_id).await?;

    Ok(Json(json!({ "released": released })))
}
