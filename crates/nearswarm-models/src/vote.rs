use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AggregationStrategy;

/// One agent's judgment on a proposal.
///
/// The confidence is guaranteed to lie in `[0.0, 1.0]`: the only way to build
/// a `Vote` is [`Vote::new`], which rejects anything else.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Vote {
    agent_id: String,
    decision: bool,
    confidence: f64,
    reasoning: String,
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("confidence {0} is outside [0, 1]")]
pub struct InvalidConfidence(pub f64);

impl Vote {
    pub fn new(
        agent_id: impl Into<String>,
        decision: bool,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Result<Self, InvalidConfidence> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(InvalidConfidence(confidence));
        }
        Ok(Self {
            agent_id: agent_id.into(),
            decision,
            confidence,
            reasoning: reasoning.into(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn decision(&self) -> bool {
        self.decision
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

impl<'de> Deserialize<'de> for Vote {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawVote {
            agent_id: String,
            decision: bool,
            confidence: f64,
            reasoning: String,
        }

        let raw = RawVote::deserialize(deserializer)?;
        Vote::new(raw.agent_id, raw.decision, raw.confidence, raw.reasoning)
            .map_err(serde::de::Error::custom)
    }
}

/// A peer that produced no vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Abstention {
    pub agent_id: String,
    pub reason: AbstentionReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbstentionReason {
    /// Did not answer before the proposal deadline.
    TimedOut,
    /// Evaluation returned an error (bad LLM output, upstream failure, ...).
    Failed(String),
}

/// Outcome of aggregating one proposal's votes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusResult {
    pub proposal_id: Uuid,
    pub consensus_reached: bool,
    /// Direction of the (weighted) majority: true when approvals hold at least half.
    pub decision: bool,
    /// Weighted share of approving votes under the configured strategy.
    pub approval_rate: f64,
    /// The number compared against `min_confidence`.
    pub score: f64,
    pub strategy: AggregationStrategy,
    pub total_votes: usize,
    pub reasons: Vec<String>,
    pub votes: Vec<Vote>,
    pub abstentions: Vec<Abstention>,
}

impl ConsensusResult {
    /// Consensus was reached and it favours the action.
    pub fn approved(&self) -> bool {
        self.consensus_reached && self.decision
    }

    pub fn confidence_scores(&self) -> Vec<f64> {
        self.votes.iter().map(Vote::confidence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_accepts_bounds() {
        assert!(Vote::new("a", true, 0.0, "").is_ok());
        assert!(Vote::new("a", true, 1.0, "").is_ok());
    }

    #[test]
    fn vote_rejects_out_of_range() {
        assert_eq!(Vote::new("a", true, 1.2, "").unwrap_err(), InvalidConfidence(1.2));
        assert!(Vote::new("a", true, -0.1, "").is_err());
        assert!(Vote::new("a", true, f64::NAN, "").is_err());
        assert!(Vote::new("a", true, f64::INFINITY, "").is_err());
    }

    #[test]
    fn invalid_confidence_is_a_std_error() {
        let err = Vote::new("a", true, 1.5, "too sure").unwrap_err();
        assert_eq!(err.to_string(), "confidence 1.5 is outside [0, 1]");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn deserialize_validates_confidence() {
        let ok: Vote = serde_json::from_value(serde_json::json!({
            "agent_id": "risk_manager",
            "decision": false,
            "confidence": 0.4,
            "reasoning": "exposure too high"
        }))
        .unwrap();
        assert_eq!(ok.agent_id(), "risk_manager");
        assert!(!ok.decision());

        let bad = serde_json::from_value::<Vote>(serde_json::json!({
            "agent_id": "risk_manager",
            "decision": true,
            "confidence": 7,
            "reasoning": "sure"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn approved_requires_consensus_and_decision() {
        let mut result = ConsensusResult {
            proposal_id: Uuid::nil(),
            consensus_reached: true,
            decision: false,
            approval_rate: 0.2,
            score: 0.9,
            strategy: AggregationStrategy::SimpleMajority,
            total_votes: 3,
            reasons: vec![],
            votes: vec![],
            abstentions: vec![],
        };
        assert!(!result.approved());
        result.decision = true;
        assert!(result.approved());
        result.consensus_reached = false;
        assert!(!result.approved());
    }

    #[test]
    fn abstention_serialization() {
        let abstention = Abstention {
            agent_id: "slow".into(),
            reason: AbstentionReason::TimedOut,
        };
        let json = serde_json::to_value(&abstention).unwrap();
        assert_eq!(json["reason"]["kind"], "timed_out");
    }
}
