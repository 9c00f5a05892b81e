use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Parameters of a proposed action.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// An action put to the swarm for a vote.
///
/// Read-only once broadcast; peers get their own clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Action tag, e.g. `trade` or `transfer`. Also accepted as `type`.
    #[serde(alias = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Params,
    /// Account of the proposing agent.
    #[serde(default)]
    pub proposer: Option<String>,
    /// Market snapshot taken when the proposal was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_context: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Why a proposal is not fit for evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalDefect {
    #[error("proposal has no action type")]
    MissingActionType,
    #[error("proposal has no params mapping")]
    MissingParams,
    #[error("proposal params must be a mapping")]
    ParamsNotObject,
    #[error("malformed proposal: {0}")]
    Malformed(String),
}

impl Proposal {
    pub fn new(action_type: impl Into<String>, params: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: action_type.into(),
            params,
            proposer: None,
            market_context: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_proposer(mut self, proposer: impl Into<String>) -> Self {
        self.proposer = Some(proposer.into());
        self
    }

    pub fn with_market_context(mut self, context: serde_json::Value) -> Self {
        self.market_context = Some(context);
        self
    }

    /// Build from loosely-shaped JSON, enforcing the `type`/`action_type` and
    /// `params` mapping requirements.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProposalDefect> {
        let has_tag = ["action_type", "type"].iter().any(|key| {
            value
                .get(*key)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.trim().is_empty())
        });
        if !has_tag {
            return Err(ProposalDefect::MissingActionType);
        }
        match value.get("params") {
            Some(serde_json::Value::Object(_)) => {}
            Some(_) => return Err(ProposalDefect::ParamsNotObject),
            None => return Err(ProposalDefect::MissingParams),
        }
        serde_json::from_value(value).map_err(|e| ProposalDefect::Malformed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ProposalDefect> {
        if self.action_type.trim().is_empty() {
            return Err(ProposalDefect::MissingActionType);
        }
        Ok(())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_type_alias() {
        let proposal = Proposal::from_value(json!({
            "type": "trade",
            "params": {"token": "near", "amount": 5}
        }))
        .unwrap();
        assert_eq!(proposal.action_type, "trade");
        assert_eq!(proposal.param_str("token"), Some("near"));
        assert_eq!(proposal.param_f64("amount"), Some(5.0));
    }

    #[test]
    fn missing_tag_rejected() {
        let err = Proposal::from_value(json!({"params": {}})).unwrap_err();
        assert_eq!(err, ProposalDefect::MissingActionType);

        let err = Proposal::from_value(json!({"action_type": "  ", "params": {}})).unwrap_err();
        assert_eq!(err, ProposalDefect::MissingActionType);
    }

    #[test]
    fn non_object_params_rejected() {
        let err = Proposal::from_value(json!({"action_type": "trade", "params": [1, 2]})).unwrap_err();
        assert_eq!(err, ProposalDefect::ParamsNotObject);
    }

    #[test]
    fn missing_params_rejected() {
        let err = Proposal::from_value(json!({"action_type": "rebalance"})).unwrap_err();
        assert_eq!(err, ProposalDefect::MissingParams);

        let proposal = Proposal::from_value(json!({"action_type": "rebalance", "params": {}})).unwrap();
        assert!(proposal.params.is_empty());
        assert!(proposal.validate().is_ok());
    }

    #[test]
    fn bad_fields_are_malformed() {
        let err = Proposal::from_value(json!({
            "action_type": "trade",
            "params": {},
            "id": "not-a-uuid"
        }))
        .unwrap_err();
        assert!(matches!(err, ProposalDefect::Malformed(reason) if reason.contains("UUID") || reason.contains("uuid")));

        let err = Proposal::from_value(json!({
            "action_type": "trade",
            "params": {},
            "created_at": "yesterday"
        }))
        .unwrap_err();
        assert!(matches!(err, ProposalDefect::Malformed(_)));
        assert!(err.to_string().starts_with("malformed proposal: "));
    }

    #[test]
    fn numeric_strings_read_as_numbers() {
        let mut params = Params::new();
        params.insert("amount".into(), json!("12.5"));
        let proposal = Proposal::new("transfer", params).with_proposer("alice.testnet");
        assert_eq!(proposal.param_f64("amount"), Some(12.5));
        assert_eq!(proposal.proposer.as_deref(), Some("alice.testnet"));
    }
}
