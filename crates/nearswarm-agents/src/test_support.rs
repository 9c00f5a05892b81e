//! Scripted collaborators for tests and offline demos.
//!
//! `ScriptedProvider` replays canned LLM replies and records the prompts it
//! saw. `ScriptedAgent` skips the LLM entirely and answers with a fixed vote
//! after an optional delay, counting lifecycle calls. `FakeChain` keeps
//! balances in memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nearswarm_models::{Proposal, Vote};
use rust_decimal::Decimal;

use crate::agent::SwarmAgent;
use crate::error::{AgentError, NearError};
use crate::llm::LlmProvider;
use crate::near::{AccountBalance, ChainClient, TransferReceipt};

/// Replays replies in order; the last one repeats once the script runs out.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(reply: impl Into<String>) -> Self {
        Self::sequence([reply.into()])
    }

    pub fn sequence<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Reply with a well-formed vote.
    pub fn voting(decision: bool, confidence: f64) -> Self {
        Self::new(
            serde_json::json!({
                "decision": decision,
                "confidence": confidence,
                "reasoning": format!("scripted vote at {confidence}"),
            })
            .to_string(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().ok()?.last().cloned()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(&self, _system: &str, prompt: &str) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| AgentError::Parse("scripted provider poisoned".into()))?;
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        reply.ok_or_else(|| AgentError::Parse("scripted provider has no replies".into()))
    }
}

enum Behaviour {
    Vote { decision: bool, confidence: f64 },
    Fail(String),
    Panic,
}

/// Agent with a fixed answer, optionally delayed to exercise deadlines.
pub struct ScriptedAgent {
    name: String,
    role: String,
    behaviour: Behaviour,
    delay: Duration,
    evaluations: AtomicUsize,
    initializations: AtomicUsize,
    cleanups: AtomicUsize,
}

impl ScriptedAgent {
    pub fn voting(name: &str, decision: bool, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            role: "scripted".to_string(),
            behaviour: Behaviour::Vote {
                decision,
                confidence,
            },
            delay: Duration::ZERO,
            evaluations: AtomicUsize::new(0),
            initializations: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        let mut agent = Self::voting(name, false, 0.0);
        agent.behaviour = Behaviour::Fail(message.to_string());
        agent
    }

    /// Panics inside `evaluate`, after any delay.
    pub fn panicking(name: &str) -> Self {
        let mut agent = Self::voting(name, false, 0.0);
        agent.behaviour = Behaviour::Panic;
        agent
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    async fn initialize(&self) -> Result<(), AgentError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, _proposal: &Proposal) -> Result<Vote, AgentError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behaviour {
            Behaviour::Vote {
                decision,
                confidence,
            } => Ok(Vote::new(
                &self.name,
                *decision,
                *confidence,
                format!("{} says {}", self.name, if *decision { "yes" } else { "no" }),
            )?),
            Behaviour::Fail(message) => Err(AgentError::Parse(message.clone())),
            Behaviour::Panic => panic!("{} blew up mid-evaluation", self.name),
        }
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory chain: fixed balance, transfers recorded instead of signed.
pub struct FakeChain {
    account_id: String,
    balance: Decimal,
    transfers: Mutex<Vec<(String, Decimal)>>,
}

impl FakeChain {
    pub fn new(account_id: &str, balance: Decimal) -> Self {
        Self {
            account_id: account_id.to_string(),
            balance,
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn transfers(&self) -> Vec<(String, Decimal)> {
        self.transfers
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn get_balance(&self, _account_id: &str) -> Result<AccountBalance, NearError> {
        Ok(AccountBalance {
            total: self.balance,
            staked: Decimal::ZERO,
            available: self.balance,
        })
    }

    async fn send_tokens(
        &self,
        receiver_id: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, NearError> {
        if amount > self.balance {
            return Err(NearError::InvalidAmount(format!(
                "{amount} exceeds balance {}",
                self.balance
            )));
        }
        self.transfers
            .lock()
            .map_err(|_| NearError::Rpc("fake chain poisoned".into()))?
            .push((receiver_id.to_string(), amount));
        Ok(TransferReceipt {
            transaction_hash: format!("fake-{receiver_id}-{amount}"),
            receiver_id: receiver_id.to_string(),
            amount,
        })
    }

    async fn call_contract(
        &self,
        contract_id: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, NearError> {
        Ok(serde_json::json!({"contract": contract_id, "method": method, "args": args}))
    }
}
