use std::collections::HashMap;
use std::sync::Arc;

use nearswarm_cache::{CacheError, MarketDataClient};
use nearswarm_models::{ConsensusResult, Params, Proposal};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent::SwarmAgent;
use crate::consensus::ConsensusEngine;
use crate::error::AgentError;

/// The proposal as broadcast, with the round's result.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalOutcome {
    pub proposal: Proposal,
    pub result: ConsensusResult,
}

/// One agent's view of the swarm: itself, its peers and a consensus engine.
pub struct Swarm {
    agent: Arc<dyn SwarmAgent>,
    peers: RwLock<Vec<Arc<dyn SwarmAgent>>>,
    engine: ConsensusEngine,
    market: Option<Arc<MarketDataClient>>,
}

impl Swarm {
    pub fn new(agent: Arc<dyn SwarmAgent>, engine: ConsensusEngine) -> Self {
        Self {
            agent,
            peers: RwLock::new(Vec::new()),
            engine,
            market: None,
        }
    }

    /// Attach live market context to proposals that name a `token`.
    pub fn with_market(mut self, market: Arc<MarketDataClient>) -> Self {
        self.market = Some(market);
        self
    }

    pub fn agent(&self) -> &Arc<dyn SwarmAgent> {
        &self.agent
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// Add peers, skipping ourselves and names already present. Returns how many joined.
    pub async fn join<I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = Arc<dyn SwarmAgent>>,
    {
        let mut joined = 0;
        for peer in peers {
            if self.handle_announcement(peer).await {
                joined += 1;
            }
        }
        info!(agent = %self.agent.name(), joined, peers = self.peers.read().await.len(), "joined swarm");
        joined
    }

    /// Register a peer that announced itself. Peers are identified by name.
    pub async fn handle_announcement(&self, peer: Arc<dyn SwarmAgent>) -> bool {
        if peer.name() == self.agent.name() {
            return false;
        }
        let mut peers = self.peers.write().await;
        if peers.iter().any(|p| p.name() == peer.name()) {
            return false;
        }
        info!(agent = %self.agent.name(), peer = %peer.name(), role = %peer.role(), "peer announced");
        peers.push(peer);
        true
    }

    pub async fn peer_names(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Put an action to the swarm and wait for the round to resolve.
    pub async fn propose_action(
        &self,
        action_type: &str,
        params: Params,
    ) -> Result<ProposalOutcome, AgentError> {
        let mut proposal = Proposal::new(action_type, params).with_proposer(self.agent.name());
        proposal
            .validate()
            .map_err(|e| AgentError::InvalidProposal(e.to_string()))?;

        if let (Some(market), Some(token)) = (&self.market, proposal.param_str("token")) {
            match market.market_context(token).await {
                Ok(context) => {
                    let context = serde_json::to_value(context)?;
                    proposal = proposal.with_market_context(context);
                }
                Err(e) => warn!(token, error = %e, "proposing without market context"),
            }
        }

        let mut voters = self.peers.read().await.clone();
        if self.engine.config().include_proposer {
            voters.push(Arc::clone(&self.agent));
        }

        let result = self.engine.reach_consensus(&proposal, &voters).await;
        Ok(ProposalOutcome { proposal, result })
    }

    /// Credit or debit every voter once the action's outcome is known.
    pub async fn record_outcome(
        &self,
        result: &ConsensusResult,
        success: bool,
    ) -> Result<(), CacheError> {
        let mut roles: HashMap<String, String> = self
            .peers
            .read()
            .await
            .iter()
            .map(|p| (p.name().to_string(), p.role().to_string()))
            .collect();
        roles.insert(self.agent.name().to_string(), self.agent.role().to_string());
        self.engine.record_outcome(result, &roles, success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedAgent;
    use nearswarm_cache::ReputationLedger;
    use nearswarm_models::{AggregationStrategy, SwarmConfig};

    fn engine(include_proposer: bool) -> ConsensusEngine {
        ConsensusEngine::new(SwarmConfig {
            min_votes: 1,
            min_confidence: 0.5,
            strategy: AggregationStrategy::SimpleMajority,
            include_proposer,
            ..SwarmConfig::default()
        })
        .unwrap()
    }

    fn agent(name: &str, decision: bool) -> Arc<dyn SwarmAgent> {
        Arc::new(ScriptedAgent::voting(name, decision, 0.8))
    }

    #[tokio::test]
    async fn join_deduplicates_by_name() {
        let swarm = Swarm::new(agent("leader", true), engine(false));
        let joined = swarm
            .join([agent("a", true), agent("b", true), agent("a", false), agent("leader", true)])
            .await;
        assert_eq!(joined, 2);
        assert_eq!(swarm.peer_names().await, vec!["a", "b"]);
        assert!(!swarm.handle_announcement(agent("b", false)).await);
        assert!(swarm.handle_announcement(agent("c", false)).await);
    }

    #[tokio::test]
    async fn proposer_votes_only_when_included() {
        let leader = Arc::new(ScriptedAgent::voting("leader", true, 0.9));
        let swarm = Swarm::new(leader.clone(), engine(false));
        swarm.join([agent("a", true)]).await;

        let outcome = swarm.propose_action("trade", Params::new()).await.unwrap();
        assert_eq!(outcome.result.total_votes, 1);
        assert_eq!(outcome.proposal.proposer.as_deref(), Some("leader"));
        assert!(outcome.proposal.market_context.is_none());
        assert_eq!(leader.evaluations(), 0);

        let leader = Arc::new(ScriptedAgent::voting("leader", true, 0.9));
        let swarm = Swarm::new(leader.clone(), engine(true));
        swarm.join([agent("a", true)]).await;
        let outcome = swarm.propose_action("trade", Params::new()).await.unwrap();
        assert_eq!(outcome.result.total_votes, 2);
        assert_eq!(leader.evaluations(), 1);
    }

    #[tokio::test]
    async fn empty_action_rejected() {
        let swarm = Swarm::new(agent("leader", true), engine(false));
        let err = swarm.propose_action("", Params::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidProposal(_)));
    }

    #[tokio::test]
    async fn outcome_updates_reputation_with_roles() {
        let ledger = Arc::new(ReputationLedger::in_memory().unwrap());
        let swarm = Swarm::new(agent("leader", true), engine(false).with_ledger(ledger.clone()));
        let analyst: Arc<dyn SwarmAgent> =
            Arc::new(ScriptedAgent::voting("analyst", false, 0.8).with_role("market_analyzer"));
        swarm.join([analyst]).await;

        let outcome = swarm.propose_action("trade", Params::new()).await.unwrap();
        swarm.record_outcome(&outcome.result, false).await.unwrap();

        let rep = ledger.get("analyst").unwrap().unwrap();
        assert_eq!(rep.role, "market_analyzer");
        assert_eq!(rep.success_rate, 1.0);
    }
}
