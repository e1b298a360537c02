//! Multiclaw configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Main Multiclaw configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MulticlawConfig {
    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Agent process configurations, in registration order
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Channel configurations
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl MulticlawConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Default configuration file location (`<config_dir>/multiclaw/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join("multiclaw").join("config.toml"))
    }

    /// Agent configurations that can be turned into runtimes.
    ///
    /// Disabled entries and entries without an id are skipped.
    pub fn resolve_agents(&self) -> Vec<AgentConfig> {
        self.agents
            .iter()
            .filter(|a| a.enabled && !a.id.trim().is_empty())
            .cloned()
            .collect()
    }

    /// Effective reply prefix mode for an agent
    pub fn reply_prefix_mode_for(&self, agent: &AgentConfig) -> ReplyPrefixMode {
        agent
            .reply_prefix_mode
            .unwrap_or(self.gateway.reply_prefix_mode)
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Agent selected when no keyword matches and no agent is active
    pub default_agent: Option<String>,

    /// Default reply prefix mode for agents that don't set their own
    pub reply_prefix_mode: ReplyPrefixMode,

    /// Default agent request timeout in milliseconds (0 = no timeout)
    pub request_timeout_ms: u64,

    /// Per-task timeout in milliseconds (0 = no timeout)
    pub task_timeout_ms: u64,

    /// Grace period for a slash command to be acknowledged
    pub slash_command_grace_ms: u64,

    /// Log undecodable agent output lines at debug level
    pub log_protocol_errors: bool,

    /// Broadcast capacity for background replies and protocol lines
    pub broadcast_capacity: usize,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18791,
            default_agent: None,
            reply_prefix_mode: ReplyPrefixMode::Always,
            request_timeout_ms: 10_000,
            task_timeout_ms: 600_000,
            slash_command_grace_ms: 2_000,
            log_protocol_errors: false,
            broadcast_capacity: 256,
            cors_origins: Vec::new(),
        }
    }
}

/// Whether replies carry an `[agent] ` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPrefixMode {
    /// Always prefix replies with the agent name
    #[default]
    Always,
    /// Never prefix replies
    Never,
}

/// One agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique, stable agent id
    pub id: String,

    /// Display name (falls back to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Trigger phrases that route text to this agent
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Executable that speaks the line protocol on stdin/stdout
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-agent reply prefix override
    #[serde(default)]
    pub reply_prefix_mode: Option<ReplyPrefixMode>,

    /// Whether this agent is registered at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AgentConfig {
    /// Create a minimal agent configuration
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            keywords: Vec::new(),
            command: default_agent_command(),
            args: default_agent_args(),
            cwd: None,
            env: HashMap::new(),
            reply_prefix_mode: None,
            enabled: true,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the trigger keywords
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Display name, or the id when no name is set
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

fn default_agent_command() -> String {
    "pi".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--mode".to_string(), "rpc".to_string()]
}

fn default_true() -> bool {
    true
}

/// Channel configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// iMessage bridge configuration
    #[serde(default)]
    pub imessage: Option<IMessageConfig>,
}

/// iMessage bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IMessageConfig {
    /// Bridge endpoint that accepts `{text, chatId, sender}`
    pub send_url: String,

    /// Request timeout for the bridge in milliseconds
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bridge_timeout_ms() -> u64 {
    15_000
}

/// Validate agent names before registration.
///
/// Ids must be non-empty and unique (case-insensitive). Keywords shared by
/// several agents are allowed; the first registered agent wins them.
pub fn validate_agents(agents: &[AgentConfig]) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut keyword_owner: HashMap<String, &str> = HashMap::new();

    for agent in agents {
        let id = agent.id.trim();
        if id.is_empty() {
            errors.push("agent id must not be empty".to_string());
            continue;
        }
        if !seen_ids.insert(id.to_lowercase()) {
            errors.push(format!("duplicate agent id: {}", id));
        }
        for keyword in &agent.keywords {
            let key = keyword.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            if let Some(owner) = keyword_owner.get(&key) {
                tracing::warn!(
                    keyword = %key,
                    owner = %owner,
                    agent_id = %id,
                    "Keyword shared by several agents; first registered agent wins"
                );
            } else {
                keyword_owner.insert(key, id);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MulticlawConfig::default();
        assert_eq!(config.gateway.port, 18791);
        assert_eq!(config.gateway.request_timeout_ms, 10_000);
        assert_eq!(config.gateway.reply_prefix_mode, ReplyPrefixMode::Always);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[gateway]
default_agent = "nova"
reply_prefix_mode = "never"

[[agents]]
id = "nova"
name = "Nova"
keywords = ["nova", "no"]

[[agents]]
id = "atlas"
keywords = ["atlas"]
reply_prefix_mode = "always"
enabled = false
"#
        )
        .unwrap();

        let config = MulticlawConfig::load(file.path()).unwrap();
        assert_eq!(config.gateway.default_agent.as_deref(), Some("nova"));
        assert_eq!(config.gateway.port, 18791);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].command, "pi");
        assert_eq!(config.agents[0].args, vec!["--mode", "rpc"]);

        let resolved = config.resolve_agents();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "nova");
        assert_eq!(
            config.reply_prefix_mode_for(&resolved[0]),
            ReplyPrefixMode::Never
        );
        assert_eq!(
            config.reply_prefix_mode_for(&config.agents[1]),
            ReplyPrefixMode::Always
        );
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway\nport = ").unwrap();
        let err = MulticlawConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(AgentConfig::new("a").display_name(), "a");
        assert_eq!(AgentConfig::new("a").with_name("Alpha").display_name(), "Alpha");
        assert_eq!(AgentConfig::new("a").with_name("  ").display_name(), "a");
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let agents = vec![AgentConfig::new("nova"), AgentConfig::new("NOVA")];
        let errors = validate_agents(&agents).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("duplicate"));
    }

    #[test]
    fn test_validate_allows_shared_keywords() {
        let agents = vec![
            AgentConfig::new("a").with_keywords(["hey"]),
            AgentConfig::new("b").with_keywords(["hey"]),
        ];
        assert!(validate_agents(&agents).is_ok());
    }
}
