pub mod agent;
pub mod consensus;
pub mod error;
pub mod llm;
pub mod near;
pub mod parser;
pub mod plugin;
pub mod prompts;
pub mod risk;
pub mod swarm;

pub mod test_support;

pub use agent::{AgentServices, RoleAgent, SwarmAgent};
pub use consensus::{AgentPerformance, ConsensusEngine, Phase, ProposalRound};
pub use error::{AgentError, NearError, PluginError};
pub use llm::{create_provider, create_provider_with, LlmProvider, MockProvider};
pub use near::{AccountBalance, ChainClient, NearRpcClient, TransferReceipt};
pub use plugin::{PluginLoader, PluginRegistry};
pub use swarm::{ProposalOutcome, Swarm};
