pub mod config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod proposal;
pub mod reputation;
pub mod vote;

pub use config::{
    AgentConfig, AggregationStrategy, LlmSettings, MarketConfig, NearNetwork, NearSettings,
    NearswarmConfig, PluginsConfig, ReputationConfig, SwarmConfig,
};
pub use descriptor::{AgentDescriptor, RiskTolerance, RoleSettings};
pub use error::ConfigError;
pub use proposal::{Params, Proposal, ProposalDefect};
pub use reputation::{AgentReputation, DEFAULT_REPUTATION};
pub use vote::{Abstention, AbstentionReason, ConsensusResult, InvalidConfidence, Vote};
