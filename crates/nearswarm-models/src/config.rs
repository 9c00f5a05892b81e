use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::ConfigError;

/// Top-level configuration for nearswarm.
///
/// Loaded once at startup: `${VAR}` references in the file are substituted,
/// then the well-known `NEAR_*` / `LLM_*` variables override the parsed values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NearswarmConfig {
    pub near: NearSettings,
    pub llm: LlmSettings,
    pub swarm: SwarmConfig,
    pub market: MarketConfig,
    pub plugins: PluginsConfig,
    pub reputation: ReputationConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NearNetwork {
    #[default]
    Testnet,
    Mainnet,
}

impl NearNetwork {
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            NearNetwork::Testnet => "https://rpc.testnet.near.org",
            NearNetwork::Mainnet => "https://rpc.mainnet.near.org",
        }
    }

    pub fn backup_rpc_url(&self) -> &'static str {
        match self {
            NearNetwork::Testnet => "https://test.rpc.fastnear.com",
            NearNetwork::Mainnet => "https://free.rpc.fastnear.com",
        }
    }
}

impl std::str::FromStr for NearNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testnet" => Ok(NearNetwork::Testnet),
            "mainnet" => Ok(NearNetwork::Mainnet),
            other => Err(ConfigError::invalid(
                "near.network",
                format!("expected testnet or mainnet, got {other:?}"),
            )),
        }
    }
}

/// NEAR account identity and RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NearSettings {
    pub network: NearNetwork,
    pub account_id: String,
    pub private_key: String,
    /// Overrides the network's default RPC endpoint.
    pub rpc_url: Option<String>,
    /// Fall back to the network's secondary endpoint when the primary fails.
    pub use_backup_rpc: bool,
}

impl NearSettings {
    /// RPC endpoints in the order they should be tried.
    pub fn rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self
            .rpc_url
            .clone()
            .unwrap_or_else(|| self.network.default_rpc_url().to_string())];
        if self.use_backup_rpc {
            urls.push(self.network.backup_rpc_url().to_string());
        }
        urls
    }

    /// Copy with the private key masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.private_key.is_empty() {
            copy.private_key = "***".to_string();
        }
        copy
    }
}

/// Chat-completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    /// `openai`, `hyperbolic` or `mock`.
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_url: Option<String>,
    pub system_prompt: Option<String>,
    /// Outbound request budget; `None` disables rate limiting.
    pub requests_per_minute: Option<u32>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "hyperbolic".to_string(),
            model: "deepseek-ai/DeepSeek-V3".to_string(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 2000,
            api_url: None,
            system_prompt: None,
            requests_per_minute: None,
        }
    }
}

impl LlmSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.trim().is_empty() {
            return Err(ConfigError::invalid("llm.provider", "provider is required"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::invalid("llm.model", "model is required"));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConfigError::invalid(
                "llm.temperature",
                format!("must be between 0 and 1, got {}", self.temperature),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("llm.max_tokens", "must be positive"));
        }
        if self.provider != "mock" && self.api_key.trim().is_empty() {
            return Err(ConfigError::invalid(
                "llm.api_key",
                format!("API key is required for provider {}", self.provider),
            ));
        }
        Ok(())
    }

    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = "***".to_string();
        }
        copy
    }
}

/// How votes are combined into a single score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Mean confidence, unweighted.
    SimpleMajority,
    /// Approval weighted by each vote's own confidence.
    #[default]
    ConfidenceWeighted,
    /// Approval weighted by each agent's historical success rate.
    ReputationWeighted,
    /// `reputation_weight * reputation + confidence_weight * confidence`.
    Hybrid,
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AggregationStrategy::SimpleMajority => "simple_majority",
            AggregationStrategy::ConfidenceWeighted => "confidence_weighted",
            AggregationStrategy::ReputationWeighted => "reputation_weighted",
            AggregationStrategy::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Swarm voting parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Role of the agent that owns this config.
    pub role: String,
    /// Minimum aggregated score (0.0 to 1.0) for consensus.
    pub min_confidence: f64,
    pub min_votes: usize,
    /// Per-proposal collection deadline in seconds.
    pub timeout_seconds: f64,
    pub strategy: AggregationStrategy,
    /// Hybrid blend weights; must sum to 1.
    pub reputation_weight: f64,
    pub confidence_weight: f64,
    /// Whether the proposing agent votes on its own proposal.
    pub include_proposer: bool,
}

/// Longest allowed per-proposal collection deadline (one day).
pub const MAX_TIMEOUT_SECONDS: f64 = 86_400.0;

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            role: "general".to_string(),
            min_confidence: 0.7,
            min_votes: 3,
            timeout_seconds: 5.0,
            strategy: AggregationStrategy::default(),
            reputation_weight: 0.3,
            confidence_weight: 0.7,
            include_proposer: false,
        }
    }
}

impl SwarmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid(
                "swarm.min_confidence",
                format!("must be between 0 and 1, got {}", self.min_confidence),
            ));
        }
        if self.min_votes == 0 {
            return Err(ConfigError::invalid("swarm.min_votes", "must be at least 1"));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(ConfigError::invalid(
                "swarm.timeout_seconds",
                "must be a positive number",
            ));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::invalid(
                "swarm.timeout_seconds",
                format!("must be at most {MAX_TIMEOUT_SECONDS}, got {}", self.timeout_seconds),
            ));
        }
        for (field, weight) in [
            ("swarm.reputation_weight", self.reputation_weight),
            ("swarm.confidence_weight", self.confidence_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::invalid(field, "must be between 0 and 1"));
            }
        }
        if (self.reputation_weight + self.confidence_weight - 1.0).abs() > 1e-6 {
            return Err(ConfigError::invalid(
                "swarm.confidence_weight",
                format!(
                    "reputation_weight + confidence_weight must equal 1, got {}",
                    self.reputation_weight + self.confidence_weight
                ),
            ));
        }
        Ok(())
    }
}

/// Market data client and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketConfig {
    pub base_url: String,
    /// How long a quote stays fresh in the cache.
    pub ttl_seconds: u64,
    pub max_capacity: u64,
    /// Calls allowed per rate-limit window.
    pub calls_per_window: u32,
    pub window_seconds: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            ttl_seconds: 60,
            max_capacity: 1_000,
            calls_per_window: 30,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory holding one `<name>/agent.yaml` per plugin.
    pub dir: String,
    /// Reuse loaded plugin instances by name.
    pub cache_instances: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: "plugins".to_string(),
            cache_instances: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReputationConfig {
    pub enabled: bool,
    /// SQLite file for the reputation log.
    pub path: String,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/reputation.db".to_string(),
        }
    }
}

/// Per-agent configuration: identity, model settings and role.
///
/// Built once per agent and never mutated afterwards.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    pub near: NearSettings,
    pub llm: LlmSettings,
}

impl NearswarmConfig {
    /// Read, substitute, parse, apply env overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str_with(&text, env::process_env)
    }

    /// Same as [`NearswarmConfig::load`] but from text and a custom env lookup.
    pub fn from_toml_str_with<F>(text: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let table: toml::Table = text.parse()?;
        let mut value = toml::Value::Table(table);
        env::substitute_toml(&mut value, &lookup)?;
        let mut config: NearswarmConfig = value.try_into()?;
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the well-known environment variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(network) = get("NEAR_NETWORK") {
            self.near.network = network.parse()?;
        }
        if let Some(account_id) = get("NEAR_ACCOUNT_ID") {
            self.near.account_id = account_id;
        }
        if let Some(private_key) = get("NEAR_PRIVATE_KEY") {
            self.near.private_key = private_key;
        }
        if let Some(rpc_url) = get("NEAR_RPC_URL") {
            self.near.rpc_url = Some(rpc_url);
        }
        if let Some(provider) = get("LLM_PROVIDER") {
            self.llm.provider = provider.to_ascii_lowercase();
        }
        if let Some(api_key) = get("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Some(model) = get("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(temperature) = get("LLM_TEMPERATURE") {
            self.llm.temperature = temperature.trim().parse().map_err(|e| {
                ConfigError::invalid("LLM_TEMPERATURE", format!("{e}: {temperature:?}"))
            })?;
        }
        if let Some(max_tokens) = get("LLM_MAX_TOKENS") {
            self.llm.max_tokens = max_tokens.trim().parse().map_err(|e| {
                ConfigError::invalid("LLM_MAX_TOKENS", format!("{e}: {max_tokens:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.swarm.validate()?;
        if self.market.calls_per_window == 0 || self.market.window_seconds == 0 {
            return Err(ConfigError::invalid(
                "market",
                "calls_per_window and window_seconds must be positive",
            ));
        }
        Ok(())
    }

    /// Copy with secrets masked, for `config show`.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.near = self.near.redacted();
        copy.llm = self.llm.redacted();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn roundtrip_config() {
        let config = NearswarmConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: NearswarmConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn config_from_toml() {
        let toml_str = r#"
[near]
network = "testnet"
account_id = "swarm.testnet"
private_key = "${NEAR_PRIVATE_KEY:-ed25519:placeholder}"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key = "sk-test"
temperature = 0.2

[swarm]
min_confidence = 0.7
min_votes = 2
timeout_seconds = 2.5
strategy = "hybrid"
reputation_weight = 0.3
confidence_weight = 0.7
"#;
        let config = NearswarmConfig::from_toml_str_with(toml_str, no_env).unwrap();
        assert_eq!(config.near.account_id, "swarm.testnet");
        assert_eq!(config.near.private_key, "ed25519:placeholder");
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.swarm.strategy, AggregationStrategy::Hybrid);
        assert_eq!(config.swarm.min_votes, 2);
        assert_eq!(config.swarm.timeout(), Duration::from_millis(2500));
        // Sections left out fall back to defaults
        assert_eq!(config.plugins.dir, "plugins");
        assert!(config.plugins.cache_instances);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = NearswarmConfig::from_toml_str_with("", no_env).unwrap();
        assert_eq!(config, NearswarmConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("NEAR_NETWORK", "mainnet"),
            ("NEAR_ACCOUNT_ID", "env.near"),
            ("LLM_PROVIDER", "Mock"),
            ("LLM_TEMPERATURE", "0.1"),
            ("LLM_MAX_TOKENS", "512"),
        ]
        .into_iter()
        .collect();
        let lookup = |name: &str| vars.get(name).map(|v| v.to_string());

        let toml_str = "[near]\naccount_id = \"file.testnet\"\n";
        let config = NearswarmConfig::from_toml_str_with(toml_str, lookup).unwrap();
        assert_eq!(config.near.network, NearNetwork::Mainnet);
        assert_eq!(config.near.account_id, "env.near");
        assert_eq!(config.llm.provider, "mock");
        assert_eq!(config.llm.temperature, 0.1);
        assert_eq!(config.llm.max_tokens, 512);
    }

    #[test]
    fn bad_env_number_is_config_error() {
        let lookup = |name: &str| (name == "LLM_MAX_TOKENS").then(|| "lots".to_string());
        let err = NearswarmConfig::from_toml_str_with("", lookup).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "LLM_MAX_TOKENS"));
    }

    #[test]
    fn env_references_in_comments_are_ignored() {
        let lookup = |name: &str| (name == "SWARM_HOME").then(|| r#"C:\swarm "lab""#.to_string());
        let toml_str = "# export ${SOMETHING_UNSET} first\n[plugins]\ndir = \"${SWARM_HOME}/plugins\"\n";
        let config = NearswarmConfig::from_toml_str_with(toml_str, lookup).unwrap();
        assert_eq!(config.plugins.dir, r#"C:\swarm "lab"/plugins"#);
    }

    #[test]
    fn missing_env_reference_fails() {
        let err = NearswarmConfig::from_toml_str_with("[llm]\napi_key = \"${LLM_API_KEY}\"\n", no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(_)));
    }

    #[test]
    fn hybrid_weights_must_sum_to_one() {
        let swarm = SwarmConfig {
            reputation_weight: 0.5,
            confidence_weight: 0.7,
            ..SwarmConfig::default()
        };
        assert!(swarm.validate().is_err());

        let swarm = SwarmConfig {
            reputation_weight: 0.4,
            confidence_weight: 0.6,
            ..SwarmConfig::default()
        };
        assert!(swarm.validate().is_ok());
    }

    #[test]
    fn swarm_rejects_out_of_range_threshold() {
        let swarm = SwarmConfig {
            min_confidence: 1.5,
            ..SwarmConfig::default()
        };
        assert!(swarm.validate().is_err());

        let swarm = SwarmConfig {
            min_votes: 0,
            ..SwarmConfig::default()
        };
        assert!(swarm.validate().is_err());
    }

    #[test]
    fn swarm_timeout_is_bounded() {
        for timeout_seconds in [0.0, -1.0, f64::NAN, 86_400.5, 1e19, 1e30] {
            let swarm = SwarmConfig {
                timeout_seconds,
                ..SwarmConfig::default()
            };
            assert!(swarm.validate().is_err(), "{timeout_seconds} accepted");
        }

        let swarm = SwarmConfig {
            timeout_seconds: MAX_TIMEOUT_SECONDS,
            ..SwarmConfig::default()
        };
        assert!(swarm.validate().is_ok());
        assert_eq!(swarm.timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn llm_settings_validation() {
        let mut llm = LlmSettings::default();
        assert!(llm.validate().is_err(), "remote provider without key");

        llm.api_key = "key".to_string();
        assert!(llm.validate().is_ok());

        llm.temperature = 1.5;
        assert!(llm.validate().is_err());

        let mock = LlmSettings {
            provider: "mock".to_string(),
            ..LlmSettings::default()
        };
        assert!(mock.validate().is_ok());
    }

    #[test]
    fn rpc_urls_with_backup() {
        let near = NearSettings {
            use_backup_rpc: true,
            ..NearSettings::default()
        };
        assert_eq!(
            near.rpc_urls(),
            vec![
                "https://rpc.testnet.near.org".to_string(),
                "https://test.rpc.fastnear.com".to_string()
            ]
        );

        let custom = NearSettings {
            rpc_url: Some("http://localhost:3030".to_string()),
            ..NearSettings::default()
        };
        assert_eq!(custom.rpc_urls(), vec!["http://localhost:3030".to_string()]);
    }

    #[test]
    fn redacted_hides_secrets() {
        let mut config = NearswarmConfig::default();
        config.near.private_key = "ed25519:secret".to_string();
        config.llm.api_key = "sk-secret".to_string();
        let shown = config.redacted();
        assert_eq!(shown.near.private_key, "***");
        assert_eq!(shown.llm.api_key, "***");
    }
}
