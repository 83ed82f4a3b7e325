// Agent registry: how each coding agent is invoked
//
// The registry is built once from settings and shared by the router and the
// server. Entries are handed out as `Arc<AgentConfig>` so concurrent requests
// can hold the same descriptor without copying or mutating it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output format an agent writes on stdout.
///
/// Informational only: output is forwarded as raw text whatever the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamFormat {
    #[default]
    Text,
    JsonLines,
    StreamJson,
}

/// How the shell context reaches the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextInjection {
    /// Context block is prepended to the prompt argument
    #[default]
    PromptPrefix,
    /// Enriched prompt is written to the agent's stdin
    Stdin,
    /// Raw prompt as argument, context exported via `AMBIENT_CONTEXT`
    Mcp,
}

/// Static description of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stream_format: StreamFormat,
    #[serde(default)]
    pub context_injection: ContextInjection,
    /// Extra arguments that continue the agent's previous conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_args: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stream_format: StreamFormat::Text,
            context_injection: ContextInjection::PromptPrefix,
            continue_args: None,
        }
    }

    pub fn with_continue_args(mut self, args: &[&str]) -> Self {
        self.continue_args = Some(args.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn with_injection(mut self, injection: ContextInjection) -> Self {
        self.context_injection = injection;
        self
    }
}

/// Agents shipped with ambient, keyed by name
pub fn builtin_agents() -> BTreeMap<String, AgentConfig> {
    [
        AgentConfig::new("claude", "claude", &["-p"]).with_continue_args(&["--continue"]),
        AgentConfig::new("codex", "codex", &["exec"]),
        AgentConfig::new("gemini", "gemini", &["-p"]),
        AgentConfig::new("aider", "aider", &["--no-auto-commits", "--yes", "--message"]),
    ]
    .into_iter()
    .map(|agent| (agent.name.clone(), agent))
    .collect()
}

/// Read-only lookup table from agent name to invocation shape
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<BTreeMap<String, Arc<AgentConfig>>>,
}

impl AgentRegistry {
    /// Build a registry. Map keys win over the `name` field inside each entry.
    pub fn new(agents: BTreeMap<String, AgentConfig>) -> Self {
        let agents = agents
            .into_iter()
            .map(|(key, mut agent)| {
                agent.name = key.clone();
                (key, Arc::new(agent))
            })
            .collect();
        Self {
            agents: Arc::new(agents),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.agents.get(name).cloned()
    }

    /// Agent names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentConfig>> {
        self.agents.values()
    }
}
