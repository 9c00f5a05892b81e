use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nearswarm_cache::{CacheError, ReputationLedger};
use nearswarm_models::{
    Abstention, AbstentionReason, AggregationStrategy, ConfigError, ConsensusResult, Proposal,
    SwarmConfig, Vote, DEFAULT_REPUTATION,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::SwarmAgent;

/// Deadline used when the configured timeout does not fit in an `Instant`.
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86_400 * 365 * 30);

/// Lifecycle of one proposal inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Proposing,
    Collecting,
    Resolved,
}

/// Tracks which phase a proposal is in and logs each transition.
#[derive(Debug)]
pub struct ProposalRound {
    proposal_id: Uuid,
    phase: Phase,
    started: Instant,
}

impl ProposalRound {
    pub fn new(proposal_id: Uuid) -> Self {
        Self {
            proposal_id,
            phase: Phase::Idle,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase. `Resolved` is terminal.
    pub fn advance(&mut self) -> Phase {
        let next = match self.phase {
            Phase::Idle => Phase::Proposing,
            Phase::Proposing => Phase::Collecting,
            Phase::Collecting | Phase::Resolved => Phase::Resolved,
        };
        if next != self.phase {
            debug!(
                proposal = %self.proposal_id,
                from = ?self.phase,
                to = ?next,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "proposal phase changed"
            );
        }
        self.phase = next;
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentPerformance {
    pub total_votes: usize,
    pub average_confidence: f64,
    pub approval_rate: f64,
}

/// Collects votes from peers and aggregates them under the configured strategy.
///
/// Votes are kept per proposal so agent track records can be inspected later.
pub struct ConsensusEngine {
    config: SwarmConfig,
    ledger: Option<Arc<ReputationLedger>>,
    history: Mutex<BTreeMap<Uuid, Vec<Vote>>>,
}

impl ConsensusEngine {
    pub fn new(config: SwarmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: None,
            history: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_ledger(mut self, ledger: Arc<ReputationLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Run one full round: fan out, collect until the deadline, aggregate.
    pub async fn reach_consensus(
        &self,
        proposal: &Proposal,
        peers: &[Arc<dyn SwarmAgent>],
    ) -> ConsensusResult {
        let mut round = ProposalRound::new(proposal.id);
        round.advance();
        info!(
            proposal = %proposal.id,
            action = %proposal.action_type,
            peers = peers.len(),
            strategy = %self.config.strategy,
            "proposal broadcast"
        );

        let (votes, abstentions) = self.collect_votes(proposal, peers, &mut round).await;
        let reputations = self.reputations(&votes);
        let result = self.aggregate(proposal.id, votes, abstentions, &reputations);
        round.advance();

        self.record_history(proposal.id, &result.votes);
        info!(
            proposal = %proposal.id,
            consensus = result.consensus_reached,
            decision = result.decision,
            score = result.score,
            votes = result.total_votes,
            abstentions = result.abstentions.len(),
            "consensus round resolved"
        );
        result
    }

    async fn collect_votes(
        &self,
        proposal: &Proposal,
        peers: &[Arc<dyn SwarmAgent>],
        round: &mut ProposalRound,
    ) -> (Vec<Vote>, Vec<Abstention>) {
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.config.timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut outstanding: BTreeMap<usize, String> = BTreeMap::new();
        let mut task_ids: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (index, peer) in peers.iter().enumerate() {
            let peer = Arc::clone(peer);
            let proposal = proposal.clone();
            outstanding.insert(index, peer.name().to_string());
            let handle = tasks.spawn(async move {
                let started = Instant::now();
                let result = peer.evaluate(&proposal).await;
                (index, result, started.elapsed())
            });
            task_ids.insert(handle.id(), index);
        }
        round.advance();

        let mut votes = Vec::new();
        let mut abstentions = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, result, elapsed)))) => {
                    let agent_id = outstanding.remove(&index).unwrap_or_default();
                    match result {
                        Ok(vote) => {
                            debug!(agent = %agent_id, decision = vote.decision(), confidence = vote.confidence(), elapsed_ms = elapsed.as_millis() as u64, "vote received");
                            votes.push(vote);
                        }
                        Err(e) => {
                            warn!(agent = %agent_id, error = %e, elapsed_ms = elapsed.as_millis() as u64, "evaluation failed, abstaining");
                            abstentions.push(Abstention {
                                agent_id,
                                reason: AbstentionReason::Failed(e.to_string()),
                            });
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    let agent_id = task_ids
                        .get(&e.id())
                        .and_then(|index| outstanding.remove(index));
                    error!(agent = agent_id.as_deref().unwrap_or("unknown"), error = %e, "evaluation task panicked");
                    if let Some(agent_id) = agent_id {
                        abstentions.push(Abstention {
                            agent_id,
                            reason: AbstentionReason::Failed("evaluation task panicked".into()),
                        });
                    }
                }
                Ok(None) => {
                    // Whatever is still outstanding panicked before reporting back.
                    for (_, agent_id) in std::mem::take(&mut outstanding) {
                        abstentions.push(Abstention {
                            agent_id,
                            reason: AbstentionReason::Failed("evaluation task panicked".into()),
                        });
                    }
                    break;
                }
                Err(_) => {
                    for (_, agent_id) in std::mem::take(&mut outstanding) {
                        warn!(agent = %agent_id, timeout_ms = self.config.timeout().as_millis() as u64, "peer missed the deadline");
                        abstentions.push(Abstention {
                            agent_id,
                            reason: AbstentionReason::TimedOut,
                        });
                    }
                    tasks.detach_all();
                    break;
                }
            }
        }
        (votes, abstentions)
    }

    fn reputations(&self, votes: &[Vote]) -> HashMap<String, f64> {
        let needs_reputation = matches!(
            self.config.strategy,
            AggregationStrategy::ReputationWeighted | AggregationStrategy::Hybrid
        );
        let Some(ledger) = self.ledger.as_ref().filter(|_| needs_reputation) else {
            return HashMap::new();
        };
        ledger
            .reputations(votes.iter().map(Vote::agent_id))
            .unwrap_or_else(|e| {
                warn!(error = %e, "reputation lookup failed, using defaults");
                HashMap::new()
            })
    }

    fn weight(&self, vote: &Vote, reputations: &HashMap<String, f64>) -> f64 {
        let reputation = || {
            reputations
                .get(vote.agent_id())
                .copied()
                .unwrap_or(DEFAULT_REPUTATION)
        };
        match self.config.strategy {
            AggregationStrategy::SimpleMajority => 1.0,
            AggregationStrategy::ConfidenceWeighted => vote.confidence(),
            AggregationStrategy::ReputationWeighted => reputation(),
            AggregationStrategy::Hybrid => {
                self.config.reputation_weight * reputation()
                    + self.config.confidence_weight * vote.confidence()
            }
        }
    }

    /// Combine collected votes into a result. Pure apart from logging.
    ///
    /// Agents missing from `reputations` count as [`DEFAULT_REPUTATION`].
    pub fn aggregate(
        &self,
        proposal_id: Uuid,
        votes: Vec<Vote>,
        abstentions: Vec<Abstention>,
        reputations: &HashMap<String, f64>,
    ) -> ConsensusResult {
        let total_votes = votes.len();
        let approvals = votes.iter().filter(|v| v.decision()).count();

        let (approval_rate, score) = if total_votes == 0 {
            (0.0, 0.0)
        } else if self.config.strategy == AggregationStrategy::SimpleMajority {
            let mean_confidence =
                votes.iter().map(Vote::confidence).sum::<f64>() / total_votes as f64;
            (approvals as f64 / total_votes as f64, mean_confidence)
        } else {
            let (approving, total) = votes.iter().fold((0.0, 0.0), |(yes, all), vote| {
                let w = self.weight(vote, reputations);
                (if vote.decision() { yes + w } else { yes }, all + w)
            });
            let rate = if total > 0.0 { approving / total } else { 0.0 };
            (rate, rate)
        };

        let mut reasons = Vec::new();
        if total_votes < self.config.min_votes {
            reasons.push(format!(
                "Insufficient votes: {total_votes} of {} required",
                self.config.min_votes
            ));
        }
        if score < self.config.min_confidence {
            reasons.push(format!(
                "Score {score:.3} is below the minimum confidence {:.3}",
                self.config.min_confidence
            ));
        }
        let consensus_reached = reasons.is_empty();
        reasons.extend(
            votes
                .iter()
                .map(|v| format!("{}: {}", v.agent_id(), v.reasoning())),
        );

        ConsensusResult {
            proposal_id,
            consensus_reached,
            decision: total_votes > 0 && approval_rate >= 0.5,
            approval_rate,
            score,
            strategy: self.config.strategy,
            total_votes,
            reasons,
            votes,
            abstentions,
        }
    }

    fn record_history(&self, proposal_id: Uuid, votes: &[Vote]) {
        match self.history.lock() {
            Ok(mut history) => {
                history.insert(proposal_id, votes.to_vec());
            }
            Err(e) => warn!(error = %e, "vote history unavailable"),
        }
    }

    pub fn vote_history(&self, proposal_id: Option<Uuid>) -> BTreeMap<Uuid, Vec<Vote>> {
        let Ok(history) = self.history.lock() else {
            return BTreeMap::new();
        };
        match proposal_id {
            Some(id) => BTreeMap::from([(id, history.get(&id).cloned().unwrap_or_default())]),
            None => history.clone(),
        }
    }

    pub fn clear_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    /// Totals across every recorded vote by `agent_id`.
    pub fn agent_performance(&self, agent_id: &str) -> AgentPerformance {
        let Ok(history) = self.history.lock() else {
            return AgentPerformance::default();
        };
        let votes: Vec<&Vote> = history
            .values()
            .flatten()
            .filter(|v| v.agent_id() == agent_id)
            .collect();
        if votes.is_empty() {
            return AgentPerformance::default();
        }
        let total = votes.len() as f64;
        AgentPerformance {
            total_votes: votes.len(),
            average_confidence: votes.iter().map(|v| v.confidence()).sum::<f64>() / total,
            approval_rate: votes.iter().filter(|v| v.decision()).count() as f64 / total,
        }
    }

    /// Fold the outcome of an executed (or skipped) action into each voter's reputation.
    ///
    /// A voter is credited when its decision matched `success`.
    pub fn record_outcome(
        &self,
        result: &ConsensusResult,
        roles: &HashMap<String, String>,
        success: bool,
    ) -> Result<(), CacheError> {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        for vote in &result.votes {
            let role = roles
                .get(vote.agent_id())
                .map(String::as_str)
                .unwrap_or("unknown");
            ledger.record_outcome(
                vote.agent_id(),
                role,
                vote.decision() == success,
                vote.confidence(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::ScriptedAgent;

    fn config(strategy: AggregationStrategy, min_votes: usize, min_confidence: f64) -> SwarmConfig {
        SwarmConfig {
            strategy,
            min_votes,
            min_confidence,
            ..SwarmConfig::default()
        }
    }

    fn vote(agent: &str, decision: bool, confidence: f64) -> Vote {
        Vote::new(agent, decision, confidence, format!("{agent} reasoning")).unwrap()
    }

    fn engine(strategy: AggregationStrategy, min_votes: usize, min_confidence: f64) -> ConsensusEngine {
        ConsensusEngine::new(config(strategy, min_votes, min_confidence)).unwrap()
    }

    #[test]
    fn round_walks_through_phases() {
        let mut round = ProposalRound::new(Uuid::nil());
        assert_eq!(round.phase(), Phase::Idle);
        assert_eq!(round.advance(), Phase::Proposing);
        assert_eq!(round.advance(), Phase::Collecting);
        assert_eq!(round.advance(), Phase::Resolved);
        assert_eq!(round.advance(), Phase::Resolved);
    }

    #[test]
    fn too_few_votes_never_reach_consensus() {
        let engine = engine(AggregationStrategy::SimpleMajority, 3, 0.5);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 1.0), vote("b", true, 1.0)],
            vec![],
            &HashMap::new(),
        );
        assert!(!result.consensus_reached);
        assert!(result.decision);
        assert!(result.reasons[0].starts_with("Insufficient votes"));
    }

    #[test]
    fn simple_majority_uses_mean_confidence() {
        let engine = engine(AggregationStrategy::SimpleMajority, 2, 0.7);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 0.9), vote("b", false, 0.8), vote("c", true, 0.7)],
            vec![],
            &HashMap::new(),
        );
        assert!(result.consensus_reached);
        assert!((result.score - 0.8).abs() < 1e-9);
        assert!((result.approval_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(result.approved());
    }

    #[test]
    fn confidence_weighted_matches_weighted_approval() {
        let engine = engine(AggregationStrategy::ConfidenceWeighted, 2, 0.7);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 0.9), vote("b", false, 0.6)],
            vec![],
            &HashMap::new(),
        );
        assert!((result.score - 0.6).abs() < 1e-9);
        assert!(!result.consensus_reached);
        assert!(result.decision);
    }

    #[test]
    fn reputation_weighted_defaults_unknown_agents() {
        let engine = engine(AggregationStrategy::ReputationWeighted, 2, 0.7);
        let reputations = HashMap::from([("a".to_string(), 0.9)]);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 0.1), vote("b", false, 1.0)],
            vec![],
            &reputations,
        );
        // 0.9 / (0.9 + 0.5)
        assert!((result.score - 0.9 / 1.4).abs() < 1e-9);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn zero_total_weight_scores_zero() {
        let engine = engine(AggregationStrategy::ConfidenceWeighted, 1, 0.0);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 0.0), vote("b", true, 0.0)],
            vec![],
            &HashMap::new(),
        );
        assert_eq!(result.score, 0.0);
        assert_eq!(result.approval_rate, 0.0);
        assert!(result.consensus_reached);
        assert!(!result.decision);
    }

    #[test]
    fn unanimous_rejection_is_consensus_against() {
        let engine = engine(AggregationStrategy::SimpleMajority, 2, 0.7);
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", false, 0.9), vote("b", false, 0.8)],
            vec![],
            &HashMap::new(),
        );
        assert!(result.consensus_reached);
        assert!(!result.decision);
        assert!(!result.approved());
    }

    #[tokio::test]
    async fn failed_and_late_peers_abstain() {
        let mut cfg = config(AggregationStrategy::ConfidenceWeighted, 1, 0.5);
        cfg.timeout_seconds = 0.1;
        let engine = ConsensusEngine::new(cfg).unwrap();
        let peers: Vec<Arc<dyn SwarmAgent>> = vec![
            Arc::new(ScriptedAgent::voting("fast", true, 0.9)),
            Arc::new(ScriptedAgent::failing("broken", "bad json")),
            Arc::new(ScriptedAgent::voting("slow", true, 0.9).with_delay(Duration::from_secs(5))),
        ];
        let proposal = Proposal::new("trade", Default::default());

        let started = Instant::now();
        let result = engine.reach_consensus(&proposal, &peers).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(result.total_votes, 1);
        assert_eq!(result.abstentions.len(), 2);
        let broken = result.abstentions.iter().find(|a| a.agent_id == "broken").unwrap();
        assert!(matches!(broken.reason, AbstentionReason::Failed(ref m) if m.contains("bad json")));
        let slow = result.abstentions.iter().find(|a| a.agent_id == "slow").unwrap();
        assert_eq!(slow.reason, AbstentionReason::TimedOut);
    }

    #[tokio::test]
    async fn panicked_peer_is_failed_even_when_deadline_passes() {
        let mut cfg = config(AggregationStrategy::ConfidenceWeighted, 1, 0.5);
        cfg.timeout_seconds = 0.2;
        let engine = ConsensusEngine::new(cfg).unwrap();
        let peers: Vec<Arc<dyn SwarmAgent>> = vec![
            Arc::new(ScriptedAgent::voting("fast", true, 0.9)),
            Arc::new(ScriptedAgent::panicking("crashy")),
            Arc::new(ScriptedAgent::voting("slow", true, 0.9).with_delay(Duration::from_secs(5))),
        ];
        let proposal = Proposal::new("trade", Default::default());

        let result = engine.reach_consensus(&proposal, &peers).await;

        assert_eq!(result.total_votes, 1);
        assert_eq!(result.abstentions.len(), 2);
        let crashy = result.abstentions.iter().find(|a| a.agent_id == "crashy").unwrap();
        assert!(matches!(crashy.reason, AbstentionReason::Failed(ref m) if m.contains("panicked")));
        let slow = result.abstentions.iter().find(|a| a.agent_id == "slow").unwrap();
        assert_eq!(slow.reason, AbstentionReason::TimedOut);
    }

    #[tokio::test]
    async fn day_long_timeout_still_collects_votes() {
        let mut cfg = config(AggregationStrategy::SimpleMajority, 1, 0.5);
        cfg.timeout_seconds = nearswarm_models::config::MAX_TIMEOUT_SECONDS;
        let engine = ConsensusEngine::new(cfg).unwrap();
        let peers: Vec<Arc<dyn SwarmAgent>> = vec![Arc::new(ScriptedAgent::voting("a", true, 0.9))];

        let result = engine.reach_consensus(&Proposal::new("trade", Default::default()), &peers).await;
        assert!(result.consensus_reached);
    }

    #[test]
    fn oversized_timeout_is_rejected_up_front() {
        let mut cfg = config(AggregationStrategy::SimpleMajority, 1, 0.5);
        cfg.timeout_seconds = 1e19;
        assert!(ConsensusEngine::new(cfg).is_err());
    }

    #[tokio::test]
    async fn history_and_performance() {
        let engine = engine(AggregationStrategy::ConfidenceWeighted, 1, 0.5);
        let peers: Vec<Arc<dyn SwarmAgent>> = vec![
            Arc::new(ScriptedAgent::voting("a", true, 0.8)),
            Arc::new(ScriptedAgent::voting("b", false, 0.4)),
        ];
        let first = Proposal::new("trade", Default::default());
        let second = Proposal::new("transfer", Default::default());
        engine.reach_consensus(&first, &peers).await;
        engine.reach_consensus(&second, &peers).await;

        assert_eq!(engine.vote_history(None).len(), 2);
        assert_eq!(engine.vote_history(Some(first.id))[&first.id].len(), 2);

        let perf = engine.agent_performance("a");
        assert_eq!(perf.total_votes, 2);
        assert!((perf.average_confidence - 0.8).abs() < 1e-9);
        assert_eq!(perf.approval_rate, 1.0);
        assert_eq!(engine.agent_performance("nobody"), AgentPerformance::default());

        engine.clear_history();
        assert!(engine.vote_history(None).is_empty());
    }

    #[tokio::test]
    async fn outcomes_feed_reputation() {
        let ledger = Arc::new(ReputationLedger::in_memory().unwrap());
        let engine = engine(AggregationStrategy::Hybrid, 1, 0.1).with_ledger(Arc::clone(&ledger));
        let result = engine.aggregate(
            Uuid::nil(),
            vec![vote("a", true, 0.9), vote("b", false, 0.7)],
            vec![],
            &HashMap::new(),
        );
        let roles = HashMap::from([("a".to_string(), "market_analyzer".to_string())]);
        engine.record_outcome(&result, &roles, true).unwrap();

        let scores = ledger.reputations(["a", "b"]).unwrap();
        assert_eq!(scores["a"], 1.0);
        assert_eq!(scores["b"], 0.0);
        assert_eq!(ledger.get("a").unwrap().unwrap().role, "market_analyzer");
        assert_eq!(ledger.get("b").unwrap().unwrap().role, "unknown");
    }
}
