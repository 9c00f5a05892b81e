//! Portfolio exposure figures handed to the risk manager's prompt.

use nearswarm_models::descriptor::RiskManagerSettings;
use nearswarm_models::Proposal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub current_exposure_ratio: Decimal,
    pub proposed_exposure_ratio: Decimal,
    pub total_exposure_ratio: Decimal,
    /// Headroom left under `max_total_exposure` before this trade.
    pub available_risk: Decimal,
    /// Largest single position allowed, in portfolio units.
    pub max_trade_size: Decimal,
    pub exceeds_position_limit: bool,
    pub exceeds_total_exposure: bool,
}

fn decimal_param(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RiskMetrics {
    /// Derive exposure from `params.portfolio` and the proposed `amount` (or `size`).
    ///
    /// Returns `Ok(None)` when the proposal carries no portfolio with a positive
    /// total value, and an error when the figures do not fit in a `Decimal`.
    pub fn compute(proposal: &Proposal, limits: &RiskManagerSettings) -> Result<Option<Self>, AgentError> {
        let Some(portfolio) = proposal.params.get("portfolio") else {
            return Ok(None);
        };
        let Some(total_value) = portfolio.get("total_value").and_then(decimal_param) else {
            return Ok(None);
        };
        if total_value <= Decimal::ZERO {
            return Ok(None);
        }
        let current_exposure = portfolio
            .get("current_exposure")
            .and_then(decimal_param)
            .unwrap_or_default();
        let proposed = ["amount", "size"]
            .iter()
            .find_map(|key| proposal.params.get(*key).and_then(decimal_param))
            .unwrap_or_default();

        let max_position = Decimal::from_f64(limits.max_position_size).unwrap_or_default();
        let max_total = Decimal::from_f64(limits.max_total_exposure).unwrap_or_default();

        let overflow = || AgentError::InvalidProposal("portfolio figures are out of range".into());
        let current_ratio = current_exposure.checked_div(total_value).ok_or_else(overflow)?;
        let proposed_ratio = proposed.checked_div(total_value).ok_or_else(overflow)?;
        let total_ratio = current_ratio.checked_add(proposed_ratio).ok_or_else(overflow)?;

        Ok(Some(Self {
            current_exposure_ratio: current_ratio,
            proposed_exposure_ratio: proposed_ratio,
            total_exposure_ratio: total_ratio,
            available_risk: max_total.checked_sub(current_ratio).ok_or_else(overflow)?,
            max_trade_size: total_value.checked_mul(max_position).ok_or_else(overflow)?,
            exceeds_position_limit: proposed_ratio > max_position,
            exceeds_total_exposure: total_ratio > max_total,
        }))
    }

    /// Bullet list for prompts, ratios shown as percentages.
    pub fn describe(&self) -> String {
        let pct = |d: Decimal| d.to_f64().unwrap_or(0.0) * 100.0;
        format!(
            "- current_exposure: {:.2}%\n\
             - proposed_exposure: {:.2}%\n\
             - total_exposure: {:.2}%\n\
             - available_risk: {:.2}%\n\
             - max_trade_size: {}\n\
             - exceeds_position_limit: {}\n\
             - exceeds_total_exposure: {}",
            pct(self.current_exposure_ratio),
            pct(self.proposed_exposure_ratio),
            pct(self.total_exposure_ratio),
            pct(self.available_risk),
            self.max_trade_size.round_dp(2),
            self.exceeds_position_limit,
            self.exceeds_total_exposure,
        )
    }
}
