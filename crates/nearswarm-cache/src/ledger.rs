use std::collections::HashMap;
use std::sync::Mutex;

use nearswarm_models::{AgentReputation, DEFAULT_REPUTATION};

use crate::error::CacheError;
use crate::reputation::ReputationStore;

/// Thread-safe handle over a [`ReputationStore`].
///
/// `rusqlite::Connection` is not `Sync`, so access goes through a `Mutex`.
pub struct ReputationLedger {
    store: Mutex<ReputationStore>,
}

impl ReputationLedger {
    pub fn new(store: ReputationStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Ok(Self::new(ReputationStore::open_in_memory()?))
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&ReputationStore) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let store = self
            .store
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("reputation mutex poisoned: {e}")))?;
        f(&store)
    }

    /// Success rate per agent, with [`DEFAULT_REPUTATION`] for unknown agents.
    pub fn reputations<'a, I>(&self, agent_ids: I) -> Result<HashMap<String, f64>, CacheError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.with_store(|store| {
            let mut scores = HashMap::new();
            for id in agent_ids {
                let score = store
                    .get(id)?
                    .map_or(DEFAULT_REPUTATION, |rep| rep.success_rate);
                scores.insert(id.to_string(), score);
            }
            Ok(scores)
        })
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentReputation>, CacheError> {
        self.with_store(|store| store.get(agent_id))
    }

    pub fn record_outcome(
        &self,
        agent_id: &str,
        role: &str,
        success: bool,
        confidence: f64,
    ) -> Result<AgentReputation, CacheError> {
        self.with_store(|store| store.record_outcome(agent_id, role, success, confidence))
    }

    pub fn snapshot(&self) -> Result<Vec<AgentReputation>, CacheError> {
        self.with_store(ReputationStore::all)
    }
}
