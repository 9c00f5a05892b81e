//! Agent plugins: a role registry plus a loader for `<dir>/<name>/agent.yaml`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nearswarm_models::descriptor::{normalize_role, DESCRIPTOR_FILE};
use nearswarm_models::{AgentConfig, AgentDescriptor, NearswarmConfig, RoleSettings};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentServices, RoleAgent, SwarmAgent};
use crate::error::PluginError;

pub type AgentFactory = Arc<
    dyn Fn(AgentDescriptor, AgentConfig, AgentServices) -> Result<Arc<dyn SwarmAgent>, PluginError>
        + Send
        + Sync,
>;

/// Maps a role name to the constructor for agents of that role.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`RoleAgent`] factory for every built-in role.
    pub fn with_builtin_roles() -> Self {
        let mut registry = Self::new();
        for role in RoleSettings::BUILTIN_ROLES {
            registry.register(role, |descriptor, config, services| {
                let agent: Arc<dyn SwarmAgent> =
                    Arc::new(RoleAgent::new(descriptor, config, services));
                Ok(agent)
            });
        }
        registry
    }

    /// Add or replace the factory for `role`.
    pub fn register<F>(&mut self, role: &str, factory: F) -> &mut Self
    where
        F: Fn(AgentDescriptor, AgentConfig, AgentServices) -> Result<Arc<dyn SwarmAgent>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        let role = normalize_role(role);
        if self.factories.insert(role.clone(), Arc::new(factory)).is_some() {
            debug!(role = %role, "replaced plugin factory");
        }
        self
    }

    pub fn contains(&self, role: &str) -> bool {
        self.factories.contains_key(&normalize_role(role))
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }

    pub fn create(
        &self,
        descriptor: AgentDescriptor,
        config: AgentConfig,
        services: AgentServices,
    ) -> Result<Arc<dyn SwarmAgent>, PluginError> {
        let factory = self.factories.get(&descriptor.role).ok_or_else(|| {
            PluginError::invalid(&descriptor.name, format!("unknown role {}", descriptor.role))
        })?;
        factory(descriptor, config, services)
    }
}

/// Loads agents from descriptor files and owns their lifecycle.
///
/// With `cache_instances` on, loading the same name twice returns the same
/// instance; with it off every load builds and initializes a fresh agent that
/// the loader does not keep.
pub struct PluginLoader {
    dir: PathBuf,
    registry: PluginRegistry,
    defaults: NearswarmConfig,
    services: AgentServices,
    cache_instances: bool,
    loaded: Mutex<BTreeMap<String, Arc<dyn SwarmAgent>>>,
}

impl PluginLoader {
    /// `defaults` supplies the inherited NEAR/LLM settings and `plugins.cache_instances`.
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: PluginRegistry,
        defaults: NearswarmConfig,
        services: AgentServices,
    ) -> Self {
        let cache_instances = defaults.plugins.cache_instances;
        Self {
            dir: dir.into(),
            registry,
            defaults,
            services,
            cache_instances,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_cache_instances(mut self, enabled: bool) -> Self {
        self.cache_instances = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    fn descriptor_path(&self, name: &str) -> Result<PathBuf, PluginError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(PluginError::invalid(name, "plugin names must be a single path component"));
        }
        Ok(self.dir.join(name).join(DESCRIPTOR_FILE))
    }

    /// Read and validate a plugin's descriptor without building the agent.
    pub async fn read_descriptor(&self, name: &str) -> Result<AgentDescriptor, PluginError> {
        let path = self.descriptor_path(name)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PluginError::NotFound(name.to_string()))
            }
            Err(e) => return Err(PluginError::invalid(name, format!("{}: {e}", path.display()))),
        };
        let descriptor =
            AgentDescriptor::from_yaml_str(&text).map_err(|e| PluginError::invalid(name, e))?;
        if descriptor.name != name {
            warn!(plugin = name, descriptor_name = %descriptor.name, "descriptor name differs from its directory");
        }
        Ok(descriptor)
    }

    async fn build(&self, name: &str) -> Result<Arc<dyn SwarmAgent>, PluginError> {
        let descriptor = self.read_descriptor(name).await?;
        let config = descriptor.agent_config(&self.defaults);
        let agent = self
            .registry
            .create(descriptor, config, self.services.clone())?;
        agent
            .initialize()
            .await
            .map_err(|source| PluginError::InitializationFailed {
                name: name.to_string(),
                source,
            })?;
        info!(plugin = name, role = agent.role(), "plugin loaded");
        Ok(agent)
    }

    /// Load, construct and initialize the plugin called `name`.
    pub async fn load_plugin(&self, name: &str) -> Result<Arc<dyn SwarmAgent>, PluginError> {
        if !self.cache_instances {
            return self.build(name).await;
        }
        // Held across the build so concurrent loads of one name share an instance.
        let mut loaded = self.loaded.lock().await;
        if let Some(agent) = loaded.get(name) {
            debug!(plugin = name, "plugin served from cache");
            return Ok(Arc::clone(agent));
        }
        let agent = self.build(name).await?;
        loaded.insert(name.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    /// Clean up and evict a cached plugin. Returns whether it was loaded.
    pub async fn unload_plugin(&self, name: &str) -> Result<bool, PluginError> {
        let Some(agent) = self.loaded.lock().await.remove(name) else {
            return Ok(false);
        };
        agent
            .cleanup()
            .await
            .map_err(|source| PluginError::Cleanup {
                name: name.to_string(),
                source,
            })?;
        info!(plugin = name, "plugin unloaded");
        Ok(true)
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<dyn SwarmAgent>> {
        self.loaded.lock().await.get(name).cloned()
    }

    pub async fn list_loaded(&self) -> Vec<String> {
        self.loaded.lock().await.keys().cloned().collect()
    }

    /// Names of the directories under the plugin dir that hold a descriptor.
    pub async fn discover(&self) -> Result<Vec<String>, PluginError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "plugin directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let has_descriptor = tokio::fs::try_exists(entry.path().join(DESCRIPTOR_FILE))
                .await
                .unwrap_or(false);
            if !has_descriptor {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Unload everything. Every plugin is attempted; the first failure is returned.
    pub async fn cleanup_all(&self) -> Result<(), PluginError> {
        let loaded = std::mem::take(&mut *self.loaded.lock().await);
        let mut first_error = None;
        for (name, agent) in loaded {
            if let Err(source) = agent.cleanup().await {
                warn!(plugin = %name, error = %source, "plugin cleanup failed");
                first_error.get_or_insert(PluginError::Cleanup { name, source });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
