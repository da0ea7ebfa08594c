//! Interpretation of the seat service's credit responses.
//!
//! The payloads arrive in the schema-less binary form handled by
//! `bodega_wire`. The field numbers and the x100 scaling below were
//! observed from live traffic, so every path is optional: a missing
//! field degrades to `None` rather than a guessed zero.

use std::collections::HashMap;

use bodega_wire::Message;

/// Raw credit integers arrive scaled by 100.
fn descale(raw: u64) -> i64 {
    (raw / 100) as i64
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditSnapshot {
    pub used: Option<i64>,
    pub monthly: Option<i64>,
    pub flex: Option<i64>,
    /// `None` when the response carries no monthly allowance to subtract
    /// from. Callers must treat that as "unknown", not "zero left".
    pub remaining: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUsage {
    pub api_key: Option<String>,
    pub name: Option<String>,
    pub email: String,
    pub upstream_id: String,
    pub used_credits: i64,
}

/// Profile response: submessage 1 holds the caller's own usage
/// (field 28), submessage 4 the team-level usage (field 17, preferred)
/// and flex balance (field 15), submessage 6 the monthly allowance
/// (field 12).
pub fn parse_profile(body: &[u8]) -> CreditSnapshot {
    let msg = Message::decode(body);
    let user_used = msg.message(1).and_then(|m| m.int(28)).map(descale);
    let team = msg.message(4);
    let team_used = team.and_then(|m| m.int(17)).map(descale);
    let flex = team.and_then(|m| m.int(15)).map(descale);
    let monthly = msg.message(6).and_then(|m| m.int(12)).map(descale);

    let used = team_used.or(user_used);
    let remaining = monthly.map(|monthly| (monthly - used.unwrap_or(0)).max(0));
    CreditSnapshot {
        used,
        monthly,
        flex,
        remaining,
    }
}

/// Plan-status response: submessage 1 holds used (field 6), flex
/// (field 4), a precomputed remaining balance (field 8) and a nested
/// plan descriptor whose field 12 is the monthly allowance.
pub fn parse_plan_status(body: &[u8]) -> CreditSnapshot {
    let msg = Message::decode(body);
    let Some(plan) = msg.message(1) else {
        return CreditSnapshot::default();
    };
    let used = plan.int(6).map(descale);
    let flex = plan.int(4).map(descale);
    let monthly = plan.message(1).and_then(|m| m.int(12)).map(descale);
    let precomputed = plan.int(8).map(descale);

    let remaining = match (monthly, used) {
        (Some(monthly), Some(used)) => Some((monthly - used).max(0)),
        _ => precomputed,
    };
    CreditSnapshot {
        used,
        monthly,
        flex,
        remaining,
    }
}

/// Member-list response: repeated submessage 1 describes each member
/// (api key, name, email, upstream id), repeated submessage 4 carries
/// per-member usage keyed by upstream id. Members without a usage row
/// count as zero.
pub fn parse_member_usage(body: &[u8]) -> Vec<MemberUsage> {
    let msg = Message::decode(body);
    let usage_by_id: HashMap<&str, i64> = msg
        .messages(4)
        .filter_map(|row| {
            let id = row.text(1)?;
            Some((id, row.int(2).map(descale).unwrap_or(0)))
        })
        .collect();

    msg.messages(1)
        .map(|member| {
            let upstream_id = member.text(6).unwrap_or_default().to_string();
            let used_credits = usage_by_id
                .get(upstream_id.as_str())
                .copied()
                .unwrap_or(0);
            MemberUsage {
                api_key: member.text(1).map(str::to_owned),
                name: member.text(2).map(str::to_owned),
                email: member.text(3).unwrap_or_default().to_string(),
                upstream_id,
                used_credits,
            }
        })
        .collect()
}
