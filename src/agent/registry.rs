//! Agent registry
//!
//! Owns one `AgentRuntime` per configured agent, in configuration order.
//! Registration order matters: it is the order the router tries keywords.

use crate::agent::runtime::{AgentListEntry, AgentRuntime};
use crate::config::{validate_agents, MulticlawConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered agents plus the default agent id
pub struct AgentRegistry {
    agents: Vec<Arc<AgentRuntime>>,
    index: HashMap<String, usize>,
    default_agent_id: String,
}

impl AgentRegistry {
    /// Build runtimes for every enabled agent in `config`.
    ///
    /// Returns `None` (after logging why) when there are no agents, when
    /// validation fails or when no default agent can be chosen.
    pub fn init_agents(config: &MulticlawConfig) -> Option<Self> {
        let configs = config.resolve_agents();
        if configs.is_empty() {
            tracing::error!("No agents configured");
            return None;
        }

        if let Err(errors) = validate_agents(&configs) {
            for error in &errors {
                tracing::error!("Invalid agent configuration: {}", error);
            }
            return None;
        }

        let mut agents = Vec::with_capacity(configs.len());
        let mut index = HashMap::with_capacity(configs.len());
        for agent_config in configs {
            let mode = config.reply_prefix_mode_for(&agent_config);
            let runtime = Arc::new(AgentRuntime::new(agent_config, mode));
            runtime.attach_list_entry();
            index.insert(runtime.id().to_string(), agents.len());
            tracing::debug!(
                agent_id = %runtime.id(),
                keywords = ?runtime.keywords(),
                "Registered agent"
            );
            agents.push(runtime);
        }

        let configured = config
            .gateway
            .default_agent
            .as_deref()
            .filter(|id| index.contains_key(*id));
        if let (Some(requested), None) = (config.gateway.default_agent.as_deref(), configured) {
            tracing::warn!(
                default_agent = %requested,
                "Configured default agent is not registered; using the first agent"
            );
        }

        let Some(default_agent_id) = configured
            .map(str::to_string)
            .or_else(|| agents.first().map(|a| a.id().to_string()))
        else {
            tracing::error!("No default agent available");
            return None;
        };

        tracing::info!(
            count = agents.len(),
            default_agent = %default_agent_id,
            "Agents initialized"
        );

        Some(Self {
            agents,
            index,
            default_agent_id,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<AgentRuntime>> {
        self.index.get(id).map(|&i| &self.agents[i])
    }

    /// All agents in registration order
    pub fn agents(&self) -> &[Arc<AgentRuntime>] {
        &self.agents
    }

    pub fn default_agent_id(&self) -> &str {
        &self.default_agent_id
    }

    pub fn default_agent(&self) -> Option<&Arc<AgentRuntime>> {
        self.get(&self.default_agent_id)
    }

    /// Display entries captured at registration, with the live pid
    pub fn list_entries(&self) -> Vec<AgentListEntry> {
        self.agents
            .iter()
            .filter_map(|a| {
                a.list_entry().map(|entry| AgentListEntry {
                    pid: a.pid(),
                    ..entry.clone()
                })
            })
            .collect()
    }

    /// Terminate every live agent process so its supervisor relaunches it.
    ///
    /// Offline agents are skipped. A failure for one agent is logged and does
    /// not stop the others. Returns how many agents were asked to terminate.
    pub async fn restart_agent_processes(&self) -> usize {
        let mut restarted = 0;
        for agent in &self.agents {
            if agent.is_offline() {
                continue;
            }
            let Some(process) = agent.process() else {
                continue;
            };

            match process.terminate().await {
                Ok(()) => {
                    restarted += 1;
                    tracing::info!(agent_id = %agent.id(), "Agent process restart requested");
                }
                Err(e) => {
                    tracing::error!(
                        agent_id = %agent.id(),
                        error = %e,
                        "Failed to restart agent process"
                    );
                }
            }
        }
        restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::runtime::testing::RecordingProcess;
    use crate::config::AgentConfig;
    use std::sync::atomic::Ordering;

    fn config(agents: Vec<AgentConfig>, default_agent: Option<&str>) -> MulticlawConfig {
        let mut config = MulticlawConfig::default();
        config.agents = agents;
        config.gateway.default_agent = default_agent.map(str::to_string);
        config
    }

    #[test]
    fn test_zero_agents_returns_none() {
        assert!(AgentRegistry::init_agents(&config(vec![], None)).is_none());

        let mut disabled = AgentConfig::new("nova");
        disabled.enabled = false;
        assert!(AgentRegistry::init_agents(&config(vec![disabled], None)).is_none());
    }

    #[test]
    fn test_duplicate_ids_return_none() {
        let agents = vec![AgentConfig::new("nova"), AgentConfig::new("Nova")];
        assert!(AgentRegistry::init_agents(&config(agents, None)).is_none());
    }

    #[test]
    fn test_default_agent_selection() {
        let agents = || vec![AgentConfig::new("nova"), AgentConfig::new("atlas")];

        let registry = AgentRegistry::init_agents(&config(agents(), Some("atlas"))).unwrap();
        assert_eq!(registry.default_agent_id(), "atlas");

        let registry = AgentRegistry::init_agents(&config(agents(), Some("ghost"))).unwrap();
        assert_eq!(registry.default_agent_id(), "nova");

        let registry = AgentRegistry::init_agents(&config(agents(), None)).unwrap();
        assert_eq!(registry.default_agent_id(), "nova");
        assert_eq!(registry.agents()[1].id(), "atlas");
        assert!(registry.get("atlas").is_some());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_list_entries() {
        let agents = vec![AgentConfig::new("nova").with_name("Nova").with_keywords(["nova", "n"])];
        let registry = AgentRegistry::init_agents(&config(agents, None)).unwrap();

        let entries = registry.list_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Nova");
        assert_eq!(entries[0].keywords, vec!["nova", "n"]);
        assert_eq!(entries[0].pid, None);

        registry.agents()[0].attach_process(Arc::new(RecordingProcess::default()));
        assert_eq!(registry.list_entries()[0].pid, Some(4242));
    }

    #[tokio::test]
    async fn test_restart_skips_offline_and_survives_failures() {
        let agents = vec![
            AgentConfig::new("nova"),
            AgentConfig::new("atlas"),
            AgentConfig::new("echo"),
        ];
        let registry = AgentRegistry::init_agents(&config(agents, None)).unwrap();

        let failing = Arc::new(RecordingProcess {
            fail_terminate: true,
            ..Default::default()
        });
        let healthy = Arc::new(RecordingProcess::default());
        let offline = Arc::new(RecordingProcess::default());

        registry.agents()[0].attach_process(failing.clone());
        registry.agents()[1].attach_process(healthy.clone());
        registry.agents()[2].attach_process(offline.clone());
        registry.agents()[2].detach_process();

        assert_eq!(registry.restart_agent_processes().await, 1);
        assert_eq!(failing.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(offline.terminated.load(Ordering::SeqCst), 0);
    }
}
