// Shell integration for ambient
//
// Installs preexec/precmd/chpwd hooks that report shell activity to the daemon
// through `ambient hook`. Detects shell type, generates snippets, and manages
// rc file installation.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Marker comments for identifying our integration block
const MARKER_START: &str = "# >>> ambient >>>";
const MARKER_END: &str = "# <<< ambient <<<";

/// Supported shell types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellType {
    Zsh,
    Bash,
    Fish,
}

impl ShellType {
    /// Detect shell type from $SHELL environment variable
    pub fn detect() -> Option<Self> {
        let shell = env::var("SHELL").ok()?;
        Self::from_path(&shell)
    }

    /// Parse shell type from a path
    pub fn from_path(path: &str) -> Option<Self> {
        let shell_name = path.rsplit('/').next()?;
        match shell_name {
            "zsh" => Some(ShellType::Zsh),
            "bash" => Some(ShellType::Bash),
            "fish" => Some(ShellType::Fish),
            _ => None,
        }
    }

    /// Get the default RC file path for this shell
    pub fn rc_file_path(&self) -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;

        let path = match self {
            ShellType::Zsh => home.join(".zshrc"),
            ShellType::Bash => {
                // Prefer .bashrc, but use .bash_profile if .bashrc doesn't exist
                let bashrc = home.join(".bashrc");
                if bashrc.exists() {
                    bashrc
                } else {
                    home.join(".bash_profile")
                }
            }
            ShellType::Fish => home.join(".config/fish/config.fish"),
        };

        Ok(path)
    }

    /// The hook snippet for this shell type, markers included
    pub fn integration_snippet(&self) -> &'static str {
        match self {
            ShellType::Zsh => ZSH_SNIPPET,
            ShellType::Bash => BASH_SNIPPET,
            ShellType::Fish => FISH_SNIPPET,
        }
    }
}

impl std::fmt::Display for ShellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellType::Zsh => write!(f, "zsh"),
            ShellType::Bash => write!(f, "bash"),
            ShellType::Fish => write!(f, "fish"),
        }
    }
}

impl std::str::FromStr for ShellType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "zsh" => Ok(ShellType::Zsh),
            "bash" => Ok(ShellType::Bash),
            "fish" => Ok(ShellType::Fish),
            _ => Err(anyhow!(
                "Unknown shell type: {}. Supported: zsh, bash, fish",
                s
            )),
        }
    }
}

// preexec runs in the foreground so it always reaches the daemon before the
// matching precmd. The hook exits immediately when no daemon is running.

/// Zsh integration snippet
const ZSH_SNIPPET: &str = r#"# >>> ambient >>>
# Reports commands, exit codes and directory changes to the ambient daemon
_ambient_preexec() {
  command ambient hook preexec --cwd "$PWD" --command "$1" >/dev/null 2>&1
}
_ambient_precmd() {
  local _ambient_status=$?
  command ambient hook precmd --cwd "$PWD" --exit-code "$_ambient_status" >/dev/null 2>&1 &!
}
_ambient_chpwd() {
  command ambient hook chpwd --cwd "$PWD" >/dev/null 2>&1 &!
}
autoload -Uz add-zsh-hook
add-zsh-hook preexec _ambient_preexec
add-zsh-hook precmd _ambient_precmd
add-zsh-hook chpwd _ambient_chpwd
# <<< ambient <<<"#;

/// Bash integration snippet
const BASH_SNIPPET: &str = r#"# >>> ambient >>>
# Reports commands, exit codes and directory changes to the ambient daemon
_ambient_in_command=1
_ambient_in_prompt=
_ambient_last_status=0
_ambient_last_pwd=
_ambient_preexec() {
  [[ -n "$COMP_LINE" || -n "$_ambient_in_command" || -n "$_ambient_in_prompt" ]] && return
  [[ "$BASH_COMMAND" == _ambient_* ]] && return
  _ambient_in_command=1
  command ambient hook preexec --cwd "$PWD" --command "$BASH_COMMAND" >/dev/null 2>&1
}
_ambient_save_status() {
  _ambient_last_status=$?
  _ambient_in_prompt=1
}
_ambient_precmd() {
  if [[ -n "$_ambient_in_command" ]]; then
    (command ambient hook precmd --cwd "$PWD" --exit-code "$_ambient_last_status" >/dev/null 2>&1 &)
  fi
  if [[ "$PWD" != "$_ambient_last_pwd" ]]; then
    _ambient_last_pwd=$PWD
    (command ambient hook chpwd --cwd "$PWD" >/dev/null 2>&1 &)
  fi
  _ambient_in_command=
  _ambient_in_prompt=
}
# Keep any DEBUG trap that was set before this file was sourced
_ambient_set_prev_debug_trap() { _ambient_prev_debug_trap=$3; }
eval "_ambient_set_prev_debug_trap $(trap -p DEBUG)"
[[ "$_ambient_prev_debug_trap" == *_ambient_debug* ]] && _ambient_prev_debug_trap=
_ambient_return() { return "$1"; }
_ambient_debug() {
  local _ambient_status=$?
  _ambient_preexec
  if [[ -n "$_ambient_prev_debug_trap" ]]; then
    _ambient_return "$_ambient_status"
    eval "$_ambient_prev_debug_trap"
  fi
}
trap '_ambient_debug' DEBUG
PROMPT_COMMAND="_ambient_save_status;${PROMPT_COMMAND:+$PROMPT_COMMAND;}_ambient_precmd"
# <<< ambient <<<"#;

/// Fish integration snippet
const FISH_SNIPPET: &str = r#"# >>> ambient >>>
# Reports commands, exit codes and directory changes to the ambient daemon
function _ambient_preexec --on-event fish_preexec
  command ambient hook preexec --cwd "$PWD" --command "$argv" >/dev/null 2>&1
end

function _ambient_postexec --on-event fish_postexec
  set -l _ambient_status $status
  command ambient hook precmd --cwd "$PWD" --exit-code $_ambient_status >/dev/null 2>&1 &
  disown 2>/dev/null
end

function _ambient_chpwd --on-variable PWD
  command ambient hook chpwd --cwd "$PWD" >/dev/null 2>&1 &
  disown 2>/dev/null
end
# <<< ambient <<<"#;

/// Install shell integration by appending to the rc file
pub fn install(shell: ShellType, rc_path: Option<PathBuf>) -> Result<PathBuf> {
    let rc_file = rc_path.map(Ok).unwrap_or_else(|| shell.rc_file_path())?;

    let existing = if rc_file.exists() {
        fs::read_to_string(&rc_file)
            .with_context(|| format!("Failed to read {}", rc_file.display()))?
    } else {
        if let Some(parent) = rc_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        String::new()
    };

    // Already installed, do nothing
    if existing.contains(MARKER_START) {
        return Ok(rc_file);
    }

    let snippet = shell.integration_snippet();
    let new_content = if existing.is_empty() || existing.ends_with('\n') {
        format!("{}{}\n", existing, snippet)
    } else {
        format!("{}\n\n{}\n", existing, snippet)
    };

    fs::write(&rc_file, new_content)
        .with_context(|| format!("Failed to write to {}", rc_file.display()))?;

    Ok(rc_file)
}

/// Remove the marked block from the rc file. Returns whether a block was removed.
pub fn uninstall(rc_path: &Path) -> Result<bool> {
    if !rc_path.exists() {
        return Ok(false);
    }

    let content = fs::read_to_string(rc_path)
        .with_context(|| format!("Failed to read {}", rc_path.display()))?;

    let (Some(start), Some(end)) = (content.find(MARKER_START), content.find(MARKER_END)) else {
        return Ok(false);
    };
    if start > end {
        return Ok(false);
    }

    let block_end = content[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .unwrap_or(content.len());

    // Swallow the blank lines install added before the block
    let before = content[..start].trim_end_matches('\n');
    let after = &content[block_end..];
    let joined = if before.is_empty() {
        after.to_string()
    } else {
        format!("{}\n{}", before, after)
    };

    let trimmed = joined.trim_end();
    let final_content = if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    };

    fs::write(rc_path, final_content)
        .with_context(|| format!("Failed to write to {}", rc_path.display()))?;

    Ok(true)
}

/// Check if shell integration is installed
pub fn is_installed(rc_path: &Path) -> Result<bool> {
    if !rc_path.exists() {
        return Ok(false);
    }

    let content = fs::read_to_string(rc_path)
        .with_context(|| format!("Failed to read {}", rc_path.display()))?;

    Ok(content.contains(MARKER_START) && content.contains(MARKER_END))
}
