use std::sync::Arc;

use async_trait::async_trait;
use nearswarm_cache::RateLimiter;
use nearswarm_models::{
    AgentConfig, AgentDescriptor, ConfigError, LlmSettings, NearSettings, Proposal, RoleSettings,
    Vote,
};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AgentError, NearError, PluginError};
use crate::llm::{create_provider_with, LlmProvider};
use crate::near::{ChainClient, NearRpcClient};
use crate::parser::parse_vote;
use crate::prompts::{chat_system_prompt, evaluation_prompt, system_prompt};
use crate::risk::RiskMetrics;

/// A swarm member. Mockable for testing.
#[async_trait]
pub trait SwarmAgent: Send + Sync {
    /// Agent id used on votes.
    fn name(&self) -> &str;
    fn role(&self) -> &str;

    fn capabilities(&self) -> &[String] {
        &[]
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn evaluate(&self, proposal: &Proposal) -> Result<Vote, AgentError>;

    async fn execute(
        &self,
        operation: &str,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        Err(PluginError::UnsupportedOperation(operation.to_string()))
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

pub type ProviderFactory =
    Arc<dyn Fn(&LlmSettings) -> Result<Arc<dyn LlmProvider>, ConfigError> + Send + Sync>;
pub type ChainFactory =
    Arc<dyn Fn(&NearSettings) -> Result<Arc<dyn ChainClient>, NearError> + Send + Sync>;

/// Collaborators built when an agent initializes.
#[derive(Clone)]
pub struct AgentServices {
    pub llm: ProviderFactory,
    /// `None` leaves agents without chain access.
    pub chain: Option<ChainFactory>,
    /// Request budget shared by every provider `llm` builds.
    pub llm_limiter: Option<Arc<RateLimiter>>,
}

impl Default for AgentServices {
    fn default() -> Self {
        Self::with_llm_limiter(None)
    }
}

impl AgentServices {
    /// Real providers and NEAR RPC clients, all drawing on one LLM budget of
    /// `llm.requests_per_minute`.
    pub fn for_llm(llm: &LlmSettings) -> Self {
        let limiter = llm
            .requests_per_minute
            .map(|rpm| Arc::new(RateLimiter::per_minute(rpm)));
        Self::with_llm_limiter(limiter)
    }

    pub fn with_llm_limiter(limiter: Option<Arc<RateLimiter>>) -> Self {
        let shared = limiter.clone();
        Self {
            llm: Arc::new(
                move |settings: &LlmSettings| -> Result<Arc<dyn LlmProvider>, ConfigError> {
                    create_provider_with(settings, shared.clone())
                },
            ),
            chain: Some(Arc::new(
                |settings: &NearSettings| -> Result<Arc<dyn ChainClient>, NearError> {
                    Ok(Arc::new(NearRpcClient::new(settings)?))
                },
            )),
            llm_limiter: limiter,
        }
    }

    pub fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm: Arc::new(
                move |_: &LlmSettings| -> Result<Arc<dyn LlmProvider>, ConfigError> {
                    Ok(Arc::clone(&provider))
                },
            ),
            chain: None,
            llm_limiter: None,
        }
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(Arc::new(
            move |_: &NearSettings| -> Result<Arc<dyn ChainClient>, NearError> {
                Ok(Arc::clone(&chain))
            },
        ));
        self
    }
}

/// LLM-backed agent whose prompt and post-processing depend on its role.
pub struct RoleAgent {
    descriptor: AgentDescriptor,
    config: AgentConfig,
    services: AgentServices,
    provider: RwLock<Option<Arc<dyn LlmProvider>>>,
    chain: RwLock<Option<Arc<dyn ChainClient>>>,
}

impl RoleAgent {
    pub fn new(descriptor: AgentDescriptor, config: AgentConfig, services: AgentServices) -> Self {
        Self {
            descriptor,
            config,
            services,
            provider: RwLock::new(None),
            chain: RwLock::new(None),
        }
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn settings(&self) -> &RoleSettings {
        &self.descriptor.settings
    }

    pub async fn is_initialized(&self) -> bool {
        self.provider.read().await.is_some()
    }

    async fn provider(&self) -> Result<Arc<dyn LlmProvider>, AgentError> {
        self.provider
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::NotInitialized(self.name().to_string()))
    }

    async fn chain(&self) -> Result<Arc<dyn ChainClient>, AgentError> {
        self.chain.read().await.clone().ok_or_else(|| {
            ConfigError::invalid("near.account_id", format!("agent {} has no NEAR account", self.name()))
                .into()
        })
    }

    /// Turn an approval below the role's threshold into a rejection.
    fn apply_threshold(&self, vote: Vote) -> Result<Vote, AgentError> {
        match self.settings().min_confidence_threshold() {
            Some(threshold) if vote.decision() && vote.confidence() < threshold => {
                debug!(agent = %self.name(), confidence = vote.confidence(), threshold, "downgrading low-confidence approval");
                Ok(Vote::new(
                    vote.agent_id(),
                    false,
                    vote.confidence(),
                    format!(
                        "{} (confidence {:.2} is below the {:.2} threshold, rejecting)",
                        vote.reasoning(),
                        vote.confidence(),
                        threshold
                    ),
                )?)
            }
            _ => Ok(vote),
        }
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.descriptor.name,
            "role": self.descriptor.role,
            "description": self.descriptor.description,
            "version": self.descriptor.version,
            "capabilities": self.descriptor.capabilities,
            "settings": self.descriptor.settings,
            "account_id": self.config.near.account_id,
            "network": self.config.near.network,
            "llm_provider": self.config.llm.provider,
            "initialized": self.is_initialized().await,
        })
    }
}

fn amount_arg(args: &serde_json::Value) -> Result<Decimal, AgentError> {
    let raw = args
        .get("amount")
        .ok_or_else(|| AgentError::InvalidProposal("transfer needs an amount".into()))?;
    let parsed = match raw {
        serde_json::Value::String(s) => s.trim().parse::<Decimal>().ok(),
        serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| AgentError::InvalidProposal(format!("invalid amount {raw}")))
}

#[async_trait]
impl SwarmAgent for RoleAgent {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn role(&self) -> &str {
        &self.descriptor.role
    }

    fn capabilities(&self) -> &[String] {
        &self.descriptor.capabilities
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        let mut provider = self.provider.write().await;
        if provider.is_some() {
            return Ok(());
        }
        let llm = (self.services.llm)(&self.config.llm)?;

        if let Some(factory) = &self.services.chain {
            if !self.config.near.account_id.is_empty() {
                *self.chain.write().await = Some(factory(&self.config.near)?);
            }
        }

        info!(agent = %self.name(), role = %self.role(), provider = llm.name(), "agent initialized");
        *provider = Some(llm);
        Ok(())
    }

    async fn evaluate(&self, proposal: &Proposal) -> Result<Vote, AgentError> {
        proposal
            .validate()
            .map_err(|e| AgentError::InvalidProposal(e.to_string()))?;
        let provider = self.provider().await?;

        let risk = match self.settings() {
            RoleSettings::RiskManager(limits) => RiskMetrics::compute(proposal, limits)?,
            _ => None,
        };
        let system = system_prompt(self.role(), self.config.llm.system_prompt.as_deref());
        let prompt = evaluation_prompt(proposal, self.settings(), risk.as_ref());

        let raw = provider.query(&system, &prompt).await?;
        let vote = self.apply_threshold(parse_vote(self.name(), &raw)?)?;
        debug!(
            agent = %self.name(),
            proposal = %proposal.id,
            decision = vote.decision(),
            confidence = vote.confidence(),
            "vote cast"
        );
        Ok(vote)
    }

    async fn execute(
        &self,
        operation: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        match operation {
            "status" => Ok(self.status().await),
            "evaluate" => {
                let proposal = Proposal::from_value(args)
                    .map_err(|e| AgentError::InvalidProposal(e.to_string()))?;
                let vote = self.evaluate(&proposal).await?;
                Ok(serde_json::to_value(vote).map_err(AgentError::from)?)
            }
            "chat" => {
                let message = args
                    .get("message")
                    .and_then(|m| m.as_str())
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| AgentError::InvalidProposal("chat needs a message".into()))?;
                let provider = self.provider().await?;
                let system =
                    chat_system_prompt(self.role(), self.config.llm.system_prompt.as_deref());
                let reply = provider.query(&system, message).await?;
                Ok(serde_json::json!({"agent": self.name(), "reply": reply}))
            }
            "balance" => {
                let chain = self.chain().await?;
                let account = args
                    .get("account_id")
                    .and_then(|a| a.as_str())
                    .unwrap_or_else(|| chain.account_id())
                    .to_string();
                let balance = chain
                    .get_balance(&account)
                    .await
                    .map_err(AgentError::from)?;
                Ok(serde_json::json!({"account_id": account, "balance": balance}))
            }
            "transfer" => {
                let chain = self.chain().await?;
                let receiver = args
                    .get("receiver_id")
                    .and_then(|r| r.as_str())
                    .ok_or_else(|| AgentError::InvalidProposal("transfer needs a receiver_id".into()))?;
                let amount = amount_arg(&args)?;
                let receipt = chain
                    .send_tokens(receiver, amount)
                    .await
                    .map_err(AgentError::from)?;
                Ok(serde_json::to_value(receipt).map_err(AgentError::from)?)
            }
            other => Err(PluginError::UnsupportedOperation(other.to_string())),
        }
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        self.provider.write().await.take();
        self.chain.write().await.take();
        info!(agent = %self.name(), "agent cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeChain, ScriptedProvider};
    use nearswarm_models::{NearswarmConfig, Params};
    use rust_decimal_macros::dec;

    fn descriptor(yaml: &str) -> AgentDescriptor {
        AgentDescriptor::from_yaml_str_with(yaml, |_| None).unwrap()
    }

    fn agent(yaml: &str, reply: &str) -> (RoleAgent, Arc<ScriptedProvider>) {
        let descriptor = descriptor(yaml);
        let config = descriptor.agent_config(&NearswarmConfig::default());
        let provider = Arc::new(ScriptedProvider::new(reply));
        let services = AgentServices::with_provider(provider.clone());
        (RoleAgent::new(descriptor, config, services), provider)
    }

    fn trade() -> Proposal {
        let mut params = Params::new();
        params.insert("token".into(), serde_json::json!("near"));
        params.insert("amount".into(), serde_json::json!(10));
        Proposal::new("trade", params)
    }

    #[tokio::test]
    async fn evaluate_before_initialize_fails() {
        let (agent, _) = agent("name: market_analyzer", r#"{"decision": true, "confidence": 0.9, "reasoning": "ok"}"#);
        let err = agent.evaluate(&trade()).await.unwrap_err();
        assert!(matches!(err, AgentError::NotInitialized(name) if name == "market_analyzer"));
    }

    #[tokio::test]
    async fn evaluate_makes_one_request() {
        let (agent, provider) = agent(
            "name: strategy_optimizer",
            r#"{"decision": true, "confidence": 0.9, "reasoning": "margin is fine"}"#,
        );
        agent.initialize().await.unwrap();

        let vote = agent.evaluate(&trade()).await.unwrap();
        assert!(vote.decision());
        assert_eq!(vote.agent_id(), "strategy_optimizer");
        assert_eq!(provider.calls(), 1);

        agent.evaluate(&trade()).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn low_confidence_approval_is_downgraded() {
        let (agent, _) = agent(
            "name: market_analyzer\nsettings:\n  min_confidence_threshold: 0.8\n",
            r#"{"decision": true, "confidence": 0.65, "reasoning": "mild uptrend"}"#,
        );
        agent.initialize().await.unwrap();

        let vote = agent.evaluate(&trade()).await.unwrap();
        assert!(!vote.decision());
        assert_eq!(vote.confidence(), 0.65);
        assert!(vote.reasoning().starts_with("mild uptrend"));
        assert!(vote.reasoning().contains("0.80 threshold"));
    }

    #[tokio::test]
    async fn rejection_is_never_upgraded() {
        let (agent, _) = agent(
            "name: decision_maker",
            r#"{"decision": false, "confidence": 0.3, "reasoning": "no"}"#,
        );
        agent.initialize().await.unwrap();
        let vote = agent.evaluate(&trade()).await.unwrap();
        assert!(!vote.decision());
        assert_eq!(vote.reasoning(), "no");
    }

    #[tokio::test]
    async fn risk_manager_prompt_carries_exposure() {
        let (agent, provider) = agent(
            "name: risk_manager",
            r#"{"decision": true, "confidence": 0.8, "reasoning": "within limits"}"#,
        );
        agent.initialize().await.unwrap();

        let mut params = Params::new();
        params.insert(
            "portfolio".into(),
            serde_json::json!({"total_value": 1000, "current_exposure": 100}),
        );
        params.insert("amount".into(), serde_json::json!(50));
        agent.evaluate(&Proposal::new("trade", params)).await.unwrap();

        let prompt = provider.last_prompt().unwrap();
        assert!(prompt.contains("Risk metrics:"));
        assert!(prompt.contains("current_exposure: 10.00%"));
    }

    #[tokio::test]
    async fn oversized_portfolio_is_an_invalid_proposal() {
        let (agent, provider) = agent(
            "name: risk_manager",
            r#"{"decision": true, "confidence": 0.8, "reasoning": "within limits"}"#,
        );
        agent.initialize().await.unwrap();

        let mut params = Params::new();
        params.insert(
            "portfolio".into(),
            serde_json::json!({
                "total_value": "0.0000001",
                "current_exposure": "79228162514264337593543950335"
            }),
        );
        let err = agent.evaluate(&Proposal::new("trade", params)).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidProposal(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn execute_evaluate_requires_params() {
        let (agent, provider) = agent(
            "name: decision_maker",
            r#"{"decision": true, "confidence": 0.9, "reasoning": "ok"}"#,
        );
        agent.initialize().await.unwrap();

        let err = agent
            .execute("evaluate", serde_json::json!({"action_type": "trade"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Agent(AgentError::InvalidProposal(_))));

        let vote = agent
            .execute("evaluate", serde_json::json!({"type": "trade", "params": {}}))
            .await
            .unwrap();
        assert_eq!(vote["decision"], true);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_an_error() {
        let (agent, _) = agent(
            "name: price_monitor",
            r#"{"decision": true, "confidence": 3, "reasoning": "sure"}"#,
        );
        agent.initialize().await.unwrap();
        let err = agent.evaluate(&trade()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfidence(_)));
    }

    #[tokio::test]
    async fn invalid_proposal_rejected_before_query() {
        let (agent, provider) = agent(
            "name: market_analyzer",
            r#"{"decision": true, "confidence": 0.9, "reasoning": "ok"}"#,
        );
        agent.initialize().await.unwrap();
        let err = agent.evaluate(&Proposal::new(" ", Params::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidProposal(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn execute_status_and_unknown_operation() {
        let (agent, _) = agent(
            "name: price_monitor\ncapabilities: [price_tracking]",
            r#"{"decision": true, "confidence": 0.9, "reasoning": "ok"}"#,
        );
        let status = agent.execute("status", serde_json::Value::Null).await.unwrap();
        assert_eq!(status["role"], "price_monitor");
        assert_eq!(status["initialized"], false);
        assert_eq!(status["capabilities"][0], "price_tracking");

        let err = agent.execute("fly", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedOperation(op) if op == "fly"));
    }

    #[tokio::test]
    async fn execute_chat_sends_free_text() {
        let (agent, provider) = agent("name: market_analyzer", "NEAR looks range-bound today.");
        agent.initialize().await.unwrap();

        let reply = agent
            .execute("chat", serde_json::json!({"message": "How is NEAR doing?"}))
            .await
            .unwrap();
        assert_eq!(reply["reply"], "NEAR looks range-bound today.");
        assert_eq!(provider.last_prompt().as_deref(), Some("How is NEAR doing?"));

        let err = agent.execute("chat", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, PluginError::Agent(AgentError::InvalidProposal(_))));
    }

    #[tokio::test]
    async fn execute_balance_and_transfer_use_chain() {
        let descriptor = descriptor("name: decision_maker\nnear:\n  account_id: swarm.testnet\n");
        let config = descriptor.agent_config(&NearswarmConfig::default());
        let chain = Arc::new(FakeChain::new("swarm.testnet", dec!(12.5)));
        let services = AgentServices::with_provider(Arc::new(ScriptedProvider::new("{}")))
            .with_chain(chain.clone());
        let agent = RoleAgent::new(descriptor, config, services);
        agent.initialize().await.unwrap();

        let balance = agent.execute("balance", serde_json::json!({})).await.unwrap();
        assert_eq!(balance["account_id"], "swarm.testnet");
        assert_eq!(balance["balance"]["total"], "12.5");

        let receipt = agent
            .execute("transfer", serde_json::json!({"receiver_id": "bob.testnet", "amount": "1.25"}))
            .await
            .unwrap();
        assert_eq!(receipt["receiver_id"], "bob.testnet");
        assert_eq!(chain.transfers(), vec![("bob.testnet".to_string(), dec!(1.25))]);
    }

    #[tokio::test]
    async fn cleanup_releases_provider() {
        let (agent, _) = agent("name: market_analyzer", "{}");
        agent.initialize().await.unwrap();
        assert!(agent.is_initialized().await);
        agent.cleanup().await.unwrap();
        assert!(!agent.is_initialized().await);
    }
}
