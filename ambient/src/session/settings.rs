// User settings loaded from ~/.ambient/config.json
//
// The file is optional. Its top-level keys shallow-override the built-in
// defaults, except `templates`, which is merged key by key.

use super::agents::{builtin_agents, AgentConfig, AgentRegistry};
use super::config::Config;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Placeholder replaced by the user's prompt when rendering a template
pub const TEMPLATE_INPUT: &str = "{{input}}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacySettings {
    /// Mask values of secret-looking `NAME=value` assignments in recorded commands
    pub redact_secrets: bool,
    /// Commands starting with any of these prefixes are never recorded
    pub exclude_commands: Vec<String>,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            redact_secrets: true,
            exclude_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_agent: String,
    pub agents: BTreeMap<String, AgentConfig>,
    pub templates: BTreeMap<String, String>,
    pub max_recent_commands: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub log_level: String,
    pub privacy: PrivacySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_agent: "claude".to_string(),
            agents: builtin_agents(),
            templates: builtin_templates(),
            max_recent_commands: 10,
            socket_path: None,
            log_level: "info".to_string(),
            privacy: PrivacySettings::default(),
        }
    }
}

fn builtin_templates() -> BTreeMap<String, String> {
    [
        ("explain", "Explain what the following does and why:\n\n{{input}}"),
        ("fix", "The last command failed. Diagnose and propose a fix:\n\n{{input}}"),
        ("review", "Review the following change for bugs and risky edits:\n\n{{input}}"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Settings {
    /// Load settings from `path`, returning defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Merge a user JSON document over the defaults
    pub fn from_json_str(content: &str) -> Result<Self> {
        let user: Value = serde_json::from_str(content)?;
        let Value::Object(user) = user else {
            anyhow::bail!("config must be a JSON object");
        };

        let mut merged = serde_json::to_value(Self::default())?;
        let Some(base) = merged.as_object_mut() else {
            anyhow::bail!("default settings did not serialize to an object");
        };

        for (key, value) in user {
            if key == "templates" {
                if let (Some(Value::Object(existing)), Value::Object(overrides)) =
                    (base.get_mut("templates"), &value)
                {
                    existing.extend(overrides.clone());
                    continue;
                }
            }
            base.insert(key, value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(self.agents.clone())
    }

    /// Apply the `socketPath` override to `config`
    pub fn apply_paths(&self, config: Config) -> Config {
        match &self.socket_path {
            Some(path) => config.with_socket_path(path.clone()),
            None => config,
        }
    }

    /// Render `prompt` through the named template
    pub fn render_template(&self, name: &str, prompt: &str) -> Option<String> {
        self.templates.get(name).map(|template| {
            if template.contains(TEMPLATE_INPUT) {
                template.replace(TEMPLATE_INPUT, prompt)
            } else {
                format!("{}\n\n{}", template, prompt)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load(&temp_dir.path().join("config.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.default_agent, "claude");
        assert_eq!(settings.max_recent_commands, 10);
    }

    #[test]
    fn test_templates_merge_by_key() {
        let settings = Settings::from_json_str(
            r#"{"templates": {"fix": "custom fix {{input}}", "tests": "write tests"}}"#,
        )
        .unwrap();

        assert_eq!(settings.templates["fix"], "custom fix {{input}}");
        assert_eq!(settings.templates["tests"], "write tests");
        // Built-ins not mentioned survive
        assert!(settings.templates.contains_key("explain"));
        assert!(settings.templates.contains_key("review"));
    }

    #[test]
    fn test_agents_are_shallow_overridden() {
        let settings = Settings::from_json_str(
            r#"{"defaultAgent": "stub", "agents": {"stub": {"name": "stub", "command": "echo"}}}"#,
        )
        .unwrap();

        assert_eq!(settings.default_agent, "stub");
        assert_eq!(settings.agents.len(), 1);
        assert!(settings.registry().get("claude").is_none());
    }

    #[test]
    fn test_scalar_overrides_keep_other_defaults() {
        let settings =
            Settings::from_json_str(r#"{"maxRecentCommands": 3, "logLevel": "debug"}"#).unwrap();
        assert_eq!(settings.max_recent_commands, 3);
        assert_eq!(settings.log_level, "debug");
        assert!(settings.privacy.redact_secrets);
        assert_eq!(settings.agents, builtin_agents());
    }

    #[test]
    fn test_non_object_config_is_rejected() {
        assert!(Settings::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.json"));
    }

    #[test]
    fn test_render_template() {
        let settings = Settings::default();
        let rendered = settings.render_template("explain", "ls -la").unwrap();
        assert!(rendered.starts_with("Explain"));
        assert!(rendered.ends_with("ls -la"));
        assert!(settings.render_template("missing", "x").is_none());
    }

    #[test]
    fn test_socket_path_override() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_home(temp_dir.path().to_path_buf());
        let settings = Settings::from_json_str(r#"{"socketPath": "/run/custom.sock"}"#).unwrap();

        let config = settings.apply_paths(config);
        assert_eq!(config.socket_path, PathBuf::from("/run/custom.sock"));
        assert_eq!(config.pid_file, temp_dir.path().join("daemon.pid"));
    }
}
