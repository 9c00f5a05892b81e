use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM request failed: {0}")]
    Llm(#[from] reqwest::Error),

    #[error("LLM provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Agent response parse error: {0}")]
    Parse(String),

    #[error("Agent returned {0}")]
    InvalidConfidence(#[from] nearswarm_models::InvalidConfidence),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Agent {0} is not initialized")]
    NotInitialized(String),

    #[error("Agent timed out after {0} ms")]
    Timeout(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] nearswarm_models::ConfigError),

    #[error("Market data error: {0}")]
    Market(#[from] nearswarm_cache::MarketDataError),

    #[error("Chain error: {0}")]
    Chain(#[from] NearError),
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin {0} not found")]
    NotFound(String),

    #[error("Invalid plugin {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("Plugin {name} failed to initialize: {source}")]
    InitializationFailed {
        name: String,
        #[source]
        source: AgentError,
    },

    #[error("Plugin {name} cleanup failed: {source}")]
    Cleanup {
        name: String,
        #[source]
        source: AgentError,
    },

    #[error("Operation {0} is not supported")]
    UnsupportedOperation(String),

    #[error("Plugin directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl PluginError {
    pub fn invalid(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PluginError::Invalid {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum NearError {
    #[error("NEAR RPC error: {0}")]
    Rpc(String),

    #[error("NEAR RPC transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transaction signing is not available in this client")]
    SigningUnavailable,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}
