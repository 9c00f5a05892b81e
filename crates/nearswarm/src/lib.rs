//! nearswarm - LLM-driven agent swarms for NEAR Protocol
//!
//! Agents are described by YAML plugin descriptors, evaluate proposals with a
//! chat-completion model, and vote; a consensus engine aggregates the votes.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use nearswarm::models::NearswarmConfig;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = NearswarmConfig::load("config/nearswarm.toml")?;
//! let loader = nearswarm::build_loader(&config);
//! let names = vec!["market_analyzer".to_string(), "risk_manager".to_string()];
//! let swarm = nearswarm::build_swarm(&config, &loader, &names).await?;
//! let outcome = swarm.propose_action("trade", Default::default()).await?;
//! println!("approved: {}", outcome.result.approved());
//! # Ok(())
//! # }
//! ```

pub use nearswarm_agents as agents;
pub use nearswarm_cache as cache;
pub use nearswarm_models as models;

pub mod manage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use nearswarm_agents::{
    AgentServices, ConsensusEngine, PluginLoader, PluginRegistry, Swarm, SwarmAgent,
};
use nearswarm_cache::{CacheError, MarketDataClient, ReputationLedger, ReputationStore};
use nearswarm_models::descriptor::{normalize_role, DESCRIPTOR_FILE};
use nearswarm_models::{
    ConfigError, ConsensusResult, NearswarmConfig, Params, Proposal, ReputationConfig,
    RoleSettings, Vote,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load the config file, or fall back to defaults plus env overrides when it is absent.
pub fn load_config(path: &Path) -> Result<NearswarmConfig, ConfigError> {
    if path.exists() {
        return NearswarmConfig::load(path);
    }
    warn!(path = %path.display(), "config file not found, using defaults");
    let mut config = NearswarmConfig::default();
    config.apply_env(nearswarm_models::env::process_env)?;
    config.validate()?;
    Ok(config)
}

/// Plugin loader over `config.plugins.dir` with the built-in roles.
///
/// Every agent it loads shares the `llm.requests_per_minute` budget.
pub fn build_loader(config: &NearswarmConfig) -> PluginLoader {
    build_loader_with(config, AgentServices::for_llm(&config.llm))
}

pub fn build_loader_with(config: &NearswarmConfig, services: AgentServices) -> PluginLoader {
    PluginLoader::new(
        &config.plugins.dir,
        PluginRegistry::with_builtin_roles(),
        config.clone(),
        services,
    )
}

pub fn open_ledger(config: &ReputationConfig) -> Result<Option<Arc<ReputationLedger>>, CacheError> {
    if !config.enabled {
        return Ok(None);
    }
    let store = ReputationStore::open(&config.path)?;
    Ok(Some(Arc::new(ReputationLedger::new(store))))
}

/// Load the named plugins into a swarm. The first name is the proposer.
pub async fn build_swarm(
    config: &NearswarmConfig,
    loader: &PluginLoader,
    names: &[String],
) -> Result<Swarm, anyhow::Error> {
    let Some((proposer, peers)) = names.split_first() else {
        bail!("a swarm needs at least one agent");
    };

    let mut engine = ConsensusEngine::new(config.swarm.clone())?;
    if let Some(ledger) = open_ledger(&config.reputation).context("Failed to open reputation store")? {
        engine = engine.with_ledger(ledger);
    }

    let leader = loader
        .load_plugin(proposer)
        .await
        .with_context(|| format!("Failed to load proposer {proposer}"))?;
    let market = MarketDataClient::new(&config.market).context("Failed to build market data client")?;
    let swarm = Swarm::new(leader, engine).with_market(Arc::new(market));

    let mut members = Vec::with_capacity(peers.len());
    for name in peers {
        let peer = loader
            .load_plugin(name)
            .await
            .with_context(|| format!("Failed to load peer {name}"))?;
        members.push(peer);
    }
    swarm.join(members).await;
    Ok(swarm)
}

/// Credit or debit every voter on `result` once the action's outcome is known.
///
/// Roles come from the voters' descriptors; voters without one are stored
/// under `unknown`. Returns the number of votes recorded.
pub async fn record_outcome(
    config: &NearswarmConfig,
    loader: &PluginLoader,
    result: &ConsensusResult,
    success: bool,
) -> Result<usize, anyhow::Error> {
    let Some(ledger) = open_ledger(&config.reputation).context("Failed to open reputation store")? else {
        bail!("reputation tracking is disabled");
    };

    let mut roles = HashMap::new();
    for vote in &result.votes {
        match loader.read_descriptor(vote.agent_id()).await {
            Ok(descriptor) => {
                roles.insert(vote.agent_id().to_string(), descriptor.role);
            }
            Err(e) => warn!(agent = vote.agent_id(), error = %e, "no descriptor for voter, role unknown"),
        }
    }

    let engine = ConsensusEngine::new(config.swarm.clone())?.with_ledger(ledger);
    engine
        .record_outcome(result, &roles, success)
        .context("Failed to record outcome")?;
    info!(proposal = %result.proposal_id, success, votes = result.votes.len(), "outcome recorded");
    Ok(result.votes.len())
}

/// Pull the consensus result out of `propose` output, or accept a bare result.
pub fn parse_consensus_result(raw: &str) -> Result<ConsensusResult, anyhow::Error> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Outcome is not valid JSON")?;
    let result = match value.get("result") {
        Some(result) => result.clone(),
        None => value,
    };
    serde_json::from_value(result).context("Outcome does not contain a consensus result")
}

#[derive(Serialize)]
struct Scaffold<'a> {
    name: &'a str,
    description: String,
    version: &'a str,
    role: &'a str,
    capabilities: Vec<String>,
    settings: serde_json::Value,
}

/// Write `<dir>/<name>/agent.yaml` with the role's default settings.
pub fn create_agent_scaffold(dir: &Path, name: &str, role: Option<&str>) -> Result<PathBuf, anyhow::Error> {
    if name.trim().is_empty() || name.contains(['/', '\\']) {
        bail!("invalid agent name {name:?}");
    }
    let role = normalize_role(role.unwrap_or(name));
    let path = dir.join(name).join(DESCRIPTOR_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let settings = serde_json::to_value(RoleSettings::for_role(&role))?
        .get("settings")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let scaffold = Scaffold {
        name,
        description: format!("{} agent", role.replace('_', " ")),
        version: "0.1.0",
        role: &role,
        capabilities: vec![role.clone()],
        settings,
    };

    std::fs::create_dir_all(dir.join(name))
        .with_context(|| format!("Failed to create {}", dir.join(name).display()))?;
    std::fs::write(&path, serde_yaml::to_string(&scaffold)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(agent = name, role = %role, path = %path.display(), "agent scaffold created");
    Ok(path)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub ticks: u64,
    pub votes: u64,
    pub failures: u64,
}

/// Evaluate a `monitor` proposal for `token` every `interval` until cancelled.
pub async fn run_agent<F>(
    agent: Arc<dyn SwarmAgent>,
    market: Option<Arc<MarketDataClient>>,
    token: &str,
    interval: Duration,
    cancel: CancellationToken,
    mut on_vote: F,
) -> RunStats
where
    F: FnMut(&Proposal, &Vote),
{
    let mut stats = RunStats::default();
    info!(agent = %agent.name(), token, interval_secs = interval.as_secs_f64(), "agent loop starting");

    loop {
        stats.ticks += 1;
        let mut params = Params::new();
        params.insert("token".into(), serde_json::json!(token));
        let mut proposal = Proposal::new("monitor", params).with_proposer(agent.name());

        if let Some(market) = &market {
            match market.market_context(token).await {
                Ok(context) => match serde_json::to_value(context) {
                    Ok(context) => proposal = proposal.with_market_context(context),
                    Err(e) => warn!(error = %e, "could not encode market context"),
                },
                Err(e) => warn!(token, error = %e, "market data unavailable"),
            }
        }

        match agent.evaluate(&proposal).await {
            Ok(vote) => {
                stats.votes += 1;
                on_vote(&proposal, &vote);
            }
            Err(e) => {
                stats.failures += 1;
                warn!(agent = %agent.name(), error = %e, "evaluation failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(agent = %agent.name(), "agent loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearswarm_agents::test_support::{ScriptedAgent, ScriptedProvider};
    use nearswarm_models::AggregationStrategy;

    fn test_config(dir: &Path) -> NearswarmConfig {
        let mut config = NearswarmConfig::default();
        config.plugins.dir = dir.display().to_string();
        config.reputation.path = dir.join("reputation.db").display().to_string();
        config.swarm.min_votes = 2;
        config.swarm.strategy = AggregationStrategy::ConfidenceWeighted;
        config
    }

    fn scripted_loader(config: &NearswarmConfig) -> PluginLoader {
        let reply = r#"{"decision": true, "confidence": 0.9, "reasoning": "fine"}"#;
        build_loader_with(
            config,
            AgentServices::with_provider(Arc::new(ScriptedProvider::new(reply))),
        )
    }

    #[test]
    fn scaffold_round_trips_through_descriptor_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_agent_scaffold(dir.path(), "guardian", Some("risk-manager")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let descriptor = nearswarm_models::AgentDescriptor::from_yaml_str_with(&text, |_| None).unwrap();
        assert_eq!(descriptor.name, "guardian");
        assert_eq!(descriptor.role, "risk_manager");
        assert_eq!(descriptor.settings, RoleSettings::for_role("risk_manager"));

        assert!(create_agent_scaffold(dir.path(), "guardian", None).is_err());
        assert!(create_agent_scaffold(dir.path(), "a/b", None).is_err());
    }

    #[tokio::test]
    async fn swarm_from_scaffolded_plugins() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["market_analyzer", "risk_manager", "strategy_optimizer"] {
            create_agent_scaffold(dir.path(), name, None).unwrap();
        }
        let config = test_config(dir.path());
        let loader = scripted_loader(&config);
        let names: Vec<String> = ["market_analyzer", "risk_manager", "strategy_optimizer"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let swarm = build_swarm(&config, &loader, &names).await.unwrap();
        assert_eq!(swarm.peer_names().await, vec!["risk_manager", "strategy_optimizer"]);

        let outcome = swarm.propose_action("stake", Params::new()).await.unwrap();
        assert!(outcome.result.approved());
        swarm.record_outcome(&outcome.result, true).await.unwrap();
        assert!(dir.path().join("reputation.db").exists());
    }

    #[tokio::test]
    async fn recorded_outcomes_feed_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["market_analyzer", "risk_manager", "strategy_optimizer"] {
            create_agent_scaffold(dir.path(), name, None).unwrap();
        }
        let config = test_config(dir.path());
        let loader = scripted_loader(&config);
        let names: Vec<String> = ["market_analyzer", "risk_manager", "strategy_optimizer"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let swarm = build_swarm(&config, &loader, &names).await.unwrap();
        let outcome = swarm.propose_action("stake", Params::new()).await.unwrap();

        // Round-trip through the printed form, as `reputation record` does.
        let printed = serde_json::to_string(&outcome).unwrap();
        let result = parse_consensus_result(&printed).unwrap();
        assert_eq!(result, outcome.result);

        let recorded = record_outcome(&config, &loader, &result, false).await.unwrap();
        assert_eq!(recorded, 2);

        let ledger = open_ledger(&config.reputation).unwrap().unwrap();
        let mut rows = ledger.snapshot().unwrap();
        rows.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].agent_id, "risk_manager");
        assert_eq!(rows[0].role, "risk_manager");
        // Every voter approved an action that failed.
        assert!(rows.iter().all(|r| r.total_operations == 1 && r.successful_operations == 0));
    }

    #[tokio::test]
    async fn recording_needs_reputation_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.reputation.enabled = false;
        let loader = scripted_loader(&config);
        let result = parse_consensus_result(
            &serde_json::json!({
                "proposal_id": "00000000-0000-0000-0000-000000000000",
                "consensus_reached": false,
                "decision": false,
                "approval_rate": 0.0,
                "score": 0.0,
                "strategy": "simple_majority",
                "total_votes": 0,
                "reasons": [],
                "votes": [],
                "abstentions": []
            })
            .to_string(),
        )
        .unwrap();
        assert!(record_outcome(&config, &loader, &result, true).await.is_err());
        assert!(parse_consensus_result("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn swarm_needs_an_agent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(build_swarm(&config, &scripted_loader(&config), &[]).await.is_err());
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let agent: Arc<dyn SwarmAgent> = Arc::new(ScriptedAgent::voting("watcher", true, 0.8));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stopper.cancel();
        });

        let mut seen = Vec::new();
        let stats = run_agent(agent, None, "near", Duration::from_millis(20), cancel, |proposal, vote| {
            seen.push((proposal.param_str("token").map(str::to_string), vote.decision()));
        })
        .await;

        assert!(stats.ticks >= 2);
        assert_eq!(stats.votes, stats.ticks);
        assert_eq!(stats.failures, 0);
        assert_eq!(seen.len() as u64, stats.votes);
        assert_eq!(seen[0], (Some("near".to_string()), true));
    }
}
