// Ambient shell context fed by shell hooks
//
// The daemon keeps the latest cwd, git state and a short command history.
// The router only ever sees the rendered block returned by `format_block`.

use super::protocol::{ContextUpdatePayload, ShellEvent};
use super::settings::PrivacySettings;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([A-Z0-9_]*(?:TOKEN|SECRET|PASSWORD|PASSWD|API_?KEY|ACCESS_?KEY)[A-Z0-9_]*)=(\S+)")
        .expect("secret pattern is valid")
});

/// One command observed between preexec and precmd
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ShellContext {
    cwd: Option<String>,
    git_branch: Option<String>,
    git_dirty: bool,
    /// Command started by preexec and not yet closed by precmd
    running: Option<CommandRecord>,
    recent: VecDeque<CommandRecord>,
    max_recent: usize,
    privacy: PrivacySettings,
}

impl ShellContext {
    pub fn new(max_recent: usize, privacy: PrivacySettings) -> Self {
        Self {
            cwd: None,
            git_branch: None,
            git_dirty: false,
            running: None,
            recent: VecDeque::with_capacity(max_recent),
            max_recent,
            privacy,
        }
    }

    pub fn apply(&mut self, update: ContextUpdatePayload) {
        self.cwd = Some(update.cwd.clone());
        if update.git_branch.is_some() {
            self.git_branch = update.git_branch;
            self.git_dirty = update.git_dirty.unwrap_or(false);
        } else if update.event == ShellEvent::Chpwd {
            // New directory without git info: not a repo
            self.git_branch = None;
            self.git_dirty = false;
        }

        match update.event {
            ShellEvent::Preexec => {
                if let Some(previous) = self.running.take() {
                    self.push(previous);
                }
                if let Some(command) = update.command.as_deref() {
                    if !self.is_excluded(command) {
                        self.running = Some(CommandRecord {
                            command: self.redact(command),
                            cwd: update.cwd,
                            exit_code: None,
                            started_at: Utc::now(),
                        });
                    }
                }
            }
            ShellEvent::Precmd => {
                if let Some(mut record) = self.running.take() {
                    record.exit_code = update.exit_code;
                    self.push(record);
                }
            }
            ShellEvent::Chpwd => {}
        }
    }

    fn push(&mut self, record: CommandRecord) {
        if self.max_recent == 0 {
            return;
        }
        while self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }

    fn is_excluded(&self, command: &str) -> bool {
        let trimmed = command.trim_start();
        self.privacy
            .exclude_commands
            .iter()
            .any(|prefix| !prefix.is_empty() && trimmed.starts_with(prefix.as_str()))
    }

    fn redact(&self, command: &str) -> String {
        if self.privacy.redact_secrets {
            SECRET_ASSIGNMENT.replace_all(command, "$1=***").into_owned()
        } else {
            command.to_string()
        }
    }

    pub fn recent(&self) -> impl Iterator<Item = &CommandRecord> {
        self.recent.iter()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Render the context block handed to agents; empty when nothing is known
    pub fn format_block(&self) -> String {
        let mut block = String::new();
        if let Some(cwd) = &self.cwd {
            let _ = writeln!(block, "cwd: {}", cwd);
        }
        if let Some(branch) = &self.git_branch {
            let state = if self.git_dirty { "dirty" } else { "clean" };
            let _ = writeln!(block, "git: {} ({})", branch, state);
        }
        if !self.recent.is_empty() {
            block.push_str("recent commands:\n");
            for record in &self.recent {
                match record.exit_code {
                    Some(code) => {
                        let _ = writeln!(block, "  $ {}  [exit {}]", record.command, code);
                    }
                    None => {
                        let _ = writeln!(block, "  $ {}", record.command);
                    }
                }
            }
        }
        block.trim_end().to_string()
    }
}
