use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Success rate assumed for agents with no recorded outcomes.
pub const DEFAULT_REPUTATION: f64 = 0.5;

/// Running track record of one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentReputation {
    pub agent_id: String,
    pub role: String,
    pub success_rate: f64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub average_confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl AgentReputation {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            success_rate: DEFAULT_REPUTATION,
            total_operations: 0,
            successful_operations: 0,
            average_confidence: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one completed action into the running averages.
    pub fn record(&mut self, success: bool, confidence: f64) {
        let previous = self.total_operations as f64;
        self.total_operations += 1;
        if success {
            self.successful_operations += 1;
        }
        let total = self.total_operations as f64;
        self.success_rate = self.successful_operations as f64 / total;
        self.average_confidence = (self.average_confidence * previous + confidence) / total;
        self.updated_at = Utc::now();
    }
}
