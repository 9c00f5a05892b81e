//! Agent descriptor files (`<plugins_dir>/<name>/agent.yaml`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, LlmSettings, NearNetwork, NearSettings, NearswarmConfig};
use crate::env;
use crate::error::ConfigError;

pub const DESCRIPTOR_FILE: &str = "agent.yaml";

/// Free-form extension fields kept alongside the typed settings.
pub type ExtraSettings = BTreeMap<String, serde_json::Value>;

/// Parsed and validated agent descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: Option<String>,
    /// Normalized role (`market-analyzer` becomes `market_analyzer`).
    pub role: String,
    pub capabilities: Vec<String>,
    pub llm: LlmOverrides,
    pub near: NearOverrides,
    pub settings: RoleSettings,
}

/// LLM fields a descriptor may override. Unset fields inherit the global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_url: Option<String>,
    pub system_prompt: Option<String>,
}

impl LlmOverrides {
    pub fn apply_to(&self, base: &LlmSettings) -> LlmSettings {
        let mut merged = base.clone();
        if let Some(provider) = &self.provider {
            merged.provider = provider.to_ascii_lowercase();
        }
        if let Some(model) = &self.model {
            merged.model = model.clone();
        }
        if let Some(api_key) = &self.api_key {
            merged.api_key = api_key.clone();
        }
        if let Some(temperature) = self.temperature {
            merged.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            merged.max_tokens = max_tokens;
        }
        if self.api_url.is_some() {
            merged.api_url = self.api_url.clone();
        }
        if self.system_prompt.is_some() {
            merged.system_prompt = self.system_prompt.clone();
        }
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NearOverrides {
    pub network: Option<NearNetwork>,
    pub account_id: Option<String>,
    pub private_key: Option<String>,
    pub rpc_url: Option<String>,
    pub use_backup_rpc: Option<bool>,
}

impl NearOverrides {
    pub fn apply_to(&self, base: &NearSettings) -> NearSettings {
        let mut merged = base.clone();
        if let Some(network) = self.network {
            merged.network = network;
        }
        if let Some(account_id) = &self.account_id {
            merged.account_id = account_id.clone();
        }
        if let Some(private_key) = &self.private_key {
            merged.private_key = private_key.clone();
        }
        if self.rpc_url.is_some() {
            merged.rpc_url = self.rpc_url.clone();
        }
        if let Some(use_backup_rpc) = self.use_backup_rpc {
            merged.use_backup_rpc = use_backup_rpc;
        }
        merged
    }
}

/// On-disk shape before settings are decoded against the role.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    llm: LlmOverrides,
    #[serde(default)]
    near: NearOverrides,
    #[serde(default)]
    settings: serde_yaml::Value,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase().replace('-', "_")
}

impl AgentDescriptor {
    /// Parse descriptor YAML, resolving `${VAR}` references with `lookup`.
    pub fn from_yaml_str_with<F>(text: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
        env::substitute_yaml(&mut value, &lookup)?;
        let raw: RawDescriptor = serde_yaml::from_value(value)?;

        if raw.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "descriptor name is empty"));
        }
        let role = normalize_role(raw.role.as_deref().unwrap_or(&raw.name));
        if role.is_empty() {
            return Err(ConfigError::invalid("role", "descriptor role is empty"));
        }
        let settings = RoleSettings::decode(&role, raw.settings)?;
        if let Some(temperature) = raw.llm.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err(ConfigError::invalid(
                    "llm.temperature",
                    format!("must be between 0 and 1, got {temperature}"),
                ));
            }
        }

        Ok(Self {
            name: raw.name,
            description: raw.description,
            version: raw.version,
            author: raw.author,
            role,
            capabilities: raw.capabilities,
            llm: raw.llm,
            near: raw.near,
            settings,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_yaml_str_with(text, env::process_env)
    }

    /// Combine this descriptor with the global defaults.
    pub fn agent_config(&self, defaults: &NearswarmConfig) -> AgentConfig {
        AgentConfig {
            name: self.name.clone(),
            role: self.role.clone(),
            near: self.near.apply_to(&defaults.near),
            llm: self.llm.apply_to(&defaults.llm),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RiskTolerance::Low => "low",
            RiskTolerance::Medium => "medium",
            RiskTolerance::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketAnalyzerSettings {
    /// Approving votes below this confidence are turned into rejections.
    pub min_confidence_threshold: f64,
    pub max_lookback_periods: u32,
    pub risk_tolerance: RiskTolerance,
    #[serde(flatten)]
    pub extra: ExtraSettings,
}

impl Default for MarketAnalyzerSettings {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.7,
            max_lookback_periods: 30,
            risk_tolerance: RiskTolerance::Medium,
            extra: ExtraSettings::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskManagerSettings {
    /// Fraction of portfolio value allowed in a single position.
    pub max_position_size: f64,
    /// Fraction of portfolio value allowed across all positions.
    pub max_total_exposure: f64,
    pub stop_loss_multiplier: f64,
    pub risk_per_trade: f64,
    #[serde(flatten)]
    pub extra: ExtraSettings,
}

impl Default for RiskManagerSettings {
    fn default() -> Self {
        Self {
            max_position_size: 0.1,
            max_total_exposure: 0.5,
            stop_loss_multiplier: 2.0,
            risk_per_trade: 0.02,
            extra: ExtraSettings::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyOptimizerSettings {
    pub min_profit_margin: f64,
    pub max_slippage: f64,
    #[serde(flatten)]
    pub extra: ExtraSettings,
}

impl Default for StrategyOptimizerSettings {
    fn default() -> Self {
        Self {
            min_profit_margin: 0.002,
            max_slippage: 0.01,
            extra: ExtraSettings::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionMakerSettings {
    pub min_confidence_threshold: f64,
    pub risk_tolerance: RiskTolerance,
    /// Largest trade amount, in the proposal's units.
    pub max_position_size: f64,
    #[serde(flatten)]
    pub extra: ExtraSettings,
}

impl Default for DecisionMakerSettings {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.7,
            risk_tolerance: RiskTolerance::Medium,
            max_position_size: 100_000.0,
            extra: ExtraSettings::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceMonitorSettings {
    pub min_confidence_threshold: f64,
    pub max_lookback_periods: u32,
    pub risk_tolerance: RiskTolerance,
    /// Absolute 24h change (percent) worth flagging.
    pub alert_threshold: f64,
    #[serde(flatten)]
    pub extra: ExtraSettings,
}

impl Default for PriceMonitorSettings {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.7,
            max_lookback_periods: 30,
            risk_tolerance: RiskTolerance::Medium,
            alert_threshold: 5.0,
            extra: ExtraSettings::new(),
        }
    }
}

/// Role-specific settings, decoded according to the descriptor's role.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", content = "settings", rename_all = "snake_case")]
pub enum RoleSettings {
    MarketAnalyzer(MarketAnalyzerSettings),
    RiskManager(RiskManagerSettings),
    StrategyOptimizer(StrategyOptimizerSettings),
    DecisionMaker(DecisionMakerSettings),
    PriceMonitor(PriceMonitorSettings),
    /// Roles without a typed schema keep their settings as a plain map.
    Custom(ExtraSettings),
}

impl RoleSettings {
    pub const BUILTIN_ROLES: [&'static str; 5] = [
        "market_analyzer",
        "risk_manager",
        "strategy_optimizer",
        "decision_maker",
        "price_monitor",
    ];

    pub fn decode(role: &str, value: serde_yaml::Value) -> Result<Self, ConfigError> {
        let value = match value {
            serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
            other => other,
        };
        let field = |e: serde_yaml::Error| ConfigError::invalid("settings", e.to_string());

        Ok(match role {
            "market_analyzer" => Self::MarketAnalyzer(serde_yaml::from_value(value).map_err(field)?),
            "risk_manager" => Self::RiskManager(serde_yaml::from_value(value).map_err(field)?),
            "strategy_optimizer" => {
                Self::StrategyOptimizer(serde_yaml::from_value(value).map_err(field)?)
            }
            "decision_maker" => Self::DecisionMaker(serde_yaml::from_value(value).map_err(field)?),
            "price_monitor" => Self::PriceMonitor(serde_yaml::from_value(value).map_err(field)?),
            _ => Self::Custom(serde_yaml::from_value(value).map_err(field)?),
        })
    }

    pub fn for_role(role: &str) -> Self {
        match role {
            "market_analyzer" => Self::MarketAnalyzer(Default::default()),
            "risk_manager" => Self::RiskManager(Default::default()),
            "strategy_optimizer" => Self::StrategyOptimizer(Default::default()),
            "decision_maker" => Self::DecisionMaker(Default::default()),
            "price_monitor" => Self::PriceMonitor(Default::default()),
            _ => Self::Custom(ExtraSettings::new()),
        }
    }

    /// Threshold under which an approving vote is downgraded, if the role has one.
    pub fn min_confidence_threshold(&self) -> Option<f64> {
        match self {
            Self::MarketAnalyzer(s) => Some(s.min_confidence_threshold),
            Self::DecisionMaker(s) => Some(s.min_confidence_threshold),
            Self::PriceMonitor(s) => Some(s.min_confidence_threshold),
            _ => None,
        }
    }
}
