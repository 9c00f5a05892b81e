use nearswarm_models::{Proposal, RoleSettings};

use crate::risk::RiskMetrics;

/// Schema description appended to every system prompt.
fn response_schema() -> String {
    let example = serde_json::json!({
        "decision": true,
        "confidence": 0.75,
        "reasoning": "<concise explanation of the decision>"
    });
    serde_json::to_string_pretty(&example).unwrap_or_default()
}

fn with_schema(role_text: &str) -> String {
    format!(
        "{role_text}\n\n\
         You vote independently on proposals put to a swarm of NEAR Protocol agents. \
         You MUST respond with ONLY a JSON object matching this schema:\n\
         {}\n\n\
         `decision` is true to approve and false to reject. `confidence` is a number \
         between 0.0 and 1.0 describing how sure you are of that decision.",
        response_schema()
    )
}

pub fn market_analyzer_system_prompt() -> String {
    with_schema(
        "You are a market analysis agent. Judge whether current market conditions \
         (price, trend, volatility, volume) support the proposed action. Weigh short-term \
         momentum against the lookback window you are given and the risk tolerance of the swarm.",
    )
}

pub fn risk_manager_system_prompt() -> String {
    with_schema(
        "You are a risk management agent. Decide whether the proposed action keeps the \
         portfolio within its position and exposure limits. Reject any action that breaches \
         a hard limit; lower your confidence as exposure approaches the limits.",
    )
}

pub fn strategy_optimizer_system_prompt() -> String {
    with_schema(
        "You are a strategy optimization agent. Decide whether the proposed action is an \
         efficient way to reach its goal, considering expected profit margin, slippage and \
         execution cost.",
    )
}

pub fn decision_maker_system_prompt() -> String {
    with_schema(
        "You are the decision-making agent. Combine the market context and the proposal's \
         parameters into a final go/no-go judgement, respecting the maximum position size.",
    )
}

pub fn price_monitor_system_prompt() -> String {
    with_schema(
        "You are a price monitoring agent. Decide whether recent price movement makes the \
         proposed action timely, flagging moves larger than the alert threshold.",
    )
}

pub fn generic_system_prompt(role: &str) -> String {
    with_schema(&format!(
        "You are a `{role}` agent. Evaluate the proposal from the point of view of your role."
    ))
}

/// System prompt for a role, unless the descriptor supplies its own.
pub fn system_prompt(role: &str, custom: Option<&str>) -> String {
    if let Some(custom) = custom.filter(|c| !c.trim().is_empty()) {
        return with_schema(custom.trim());
    }
    match role {
        "market_analyzer" => market_analyzer_system_prompt(),
        "risk_manager" => risk_manager_system_prompt(),
        "strategy_optimizer" => strategy_optimizer_system_prompt(),
        "decision_maker" => decision_maker_system_prompt(),
        "price_monitor" => price_monitor_system_prompt(),
        other => generic_system_prompt(other),
    }
}

/// Free-form conversation prompt: the role text without the vote schema.
pub fn chat_system_prompt(role: &str, custom: Option<&str>) -> String {
    let persona = custom
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("You are the `{role}` agent of a NEAR Protocol agent swarm."));
    format!(
        "{persona}\n\nAnswer the operator's questions in plain text. Be brief and say so \
         when you lack the data to answer."
    )
}

fn role_guidance(settings: &RoleSettings) -> String {
    match settings {
        RoleSettings::MarketAnalyzer(s) => format!(
            "Risk tolerance: {}\nLookback periods: {}\nMinimum confidence to approve: {}",
            s.risk_tolerance, s.max_lookback_periods, s.min_confidence_threshold
        ),
        RoleSettings::RiskManager(s) => format!(
            "Risk limits:\n\
             - Maximum position size: {:.1}% of portfolio\n\
             - Maximum total exposure: {:.1}% of portfolio\n\
             - Risk per trade: {:.1}% of portfolio\n\
             - Stop-loss multiplier: {}",
            s.max_position_size * 100.0,
            s.max_total_exposure * 100.0,
            s.risk_per_trade * 100.0,
            s.stop_loss_multiplier
        ),
        RoleSettings::StrategyOptimizer(s) => format!(
            "Minimum profit margin: {:.2}%\nMaximum slippage: {:.2}%",
            s.min_profit_margin * 100.0,
            s.max_slippage * 100.0
        ),
        RoleSettings::DecisionMaker(s) => format!(
            "Risk tolerance: {}\nMaximum position size: {}\nMinimum confidence to approve: {}",
            s.risk_tolerance, s.max_position_size, s.min_confidence_threshold
        ),
        RoleSettings::PriceMonitor(s) => format!(
            "Alert threshold: {}% move in 24h\nLookback periods: {}\nRisk tolerance: {}",
            s.alert_threshold, s.max_lookback_periods, s.risk_tolerance
        ),
        RoleSettings::Custom(extra) if extra.is_empty() => String::new(),
        RoleSettings::Custom(extra) => extra
            .iter()
            .map(|(key, value)| format!("- {key}: {value}"))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// User prompt describing one proposal.
pub fn evaluation_prompt(
    proposal: &Proposal,
    settings: &RoleSettings,
    risk: Option<&RiskMetrics>,
) -> String {
    let params = serde_json::to_string_pretty(&proposal.params).unwrap_or_default();
    let market = proposal
        .market_context
        .as_ref()
        .and_then(|ctx| serde_json::to_string_pretty(ctx).ok())
        .unwrap_or_else(|| "No market data available".to_string());

    let mut prompt = format!(
        "Proposal {id}\nAction: {action}\nProposer: {proposer}\n\nParameters:\n{params}\n\n\
         Market context:\n{market}",
        id = proposal.id,
        action = proposal.action_type,
        proposer = proposal.proposer.as_deref().unwrap_or("unknown"),
    );

    if let Some(risk) = risk {
        prompt.push_str("\n\nRisk metrics:\n");
        prompt.push_str(&risk.describe());
    }

    let guidance = role_guidance(settings);
    if !guidance.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&guidance);
    }

    prompt.push_str("\n\nShould the swarm approve this action?");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearswarm_models::Params;

    #[test]
    fn all_builtin_roles_have_distinct_prompts() {
        let prompts: Vec<String> = RoleSettings::BUILTIN_ROLES
            .iter()
            .map(|role| system_prompt(role, None))
            .collect();
        for (i, a) in prompts.iter().enumerate() {
            assert!(a.contains("\"confidence\""));
            for b in &prompts[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn custom_prompt_keeps_schema() {
        let prompt = system_prompt("market_analyzer", Some("Only approve NEAR trades."));
        assert!(prompt.starts_with("Only approve NEAR trades."));
        assert!(prompt.contains("\"decision\""));
    }

    #[test]
    fn chat_prompt_has_no_vote_schema() {
        let prompt = chat_system_prompt("risk_manager", None);
        assert!(prompt.contains("`risk_manager`"));
        assert!(!prompt.contains("\"decision\""));

        let custom = chat_system_prompt("risk_manager", Some("You are Ada."));
        assert!(custom.starts_with("You are Ada."));
    }

    #[test]
    fn unknown_role_gets_generic_prompt() {
        assert!(system_prompt("arbitrage_scout", None).contains("`arbitrage_scout`"));
    }

    #[test]
    fn evaluation_prompt_includes_settings() {
        let mut params = Params::new();
        params.insert("token".into(), serde_json::json!("near"));
        let proposal = Proposal::new("trade", params).with_proposer("alice.testnet");

        let prompt = evaluation_prompt(&proposal, &RoleSettings::for_role("risk_manager"), None);
        assert!(prompt.contains("Action: trade"));
        assert!(prompt.contains("alice.testnet"));
        assert!(prompt.contains("Maximum position size: 10.0%"));
        assert!(prompt.contains("No market data available"));
    }
}
