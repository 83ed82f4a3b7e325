// ambient: CLI for talking to ambient-daemon
//
// Commands:
//   ambient ask <prompt...> [--agent <name>] [--template <name>] [--new-session] [--json]
//   ambient hook <preexec|precmd|chpwd> --cwd <dir> [--command <cmd>] [--exit-code <n>]
//   ambient new-session | status | agents | ping
//   ambient start | stop
//   ambient shell-integration [--install | --uninstall] [--shell <zsh|bash|fish>]

use ambient_lib::session::{
    config::Config,
    daemon_client::{ClientError, ClientResult, DaemonClient, DEFAULT_TIMEOUT},
    protocol::{
        ContextUpdatePayload, DaemonRequest, DaemonResponse, NewSessionPayload, QueryPayload,
        ShellEvent,
    },
    settings::Settings,
    shell_integration::{self, ShellType},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding a tracing filter for the CLI
const LOG_ENV: &str = "AMBIENT_LOG";

/// Shell hooks must never hold up the prompt for long
const HOOK_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `start` waits for a freshly spawned daemon
const START_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "ambient")]
#[command(version)]
#[command(about = "Ask coding agents from your shell, with your shell's context")]
struct Cli {
    /// Configuration file path (defaults to ~/.ambient/config.json)
    #[arg(short, long, global = true, env = "AMBIENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask an agent; piped stdin is attached as input
    Ask {
        /// The question or task
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Agent to use instead of the session's agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Prompt template to render the question through
        #[arg(short, long)]
        template: Option<String>,

        /// Start a fresh session before asking
        #[arg(long)]
        new_session: bool,

        /// Seconds to wait for the agent to finish
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Print the result as JSON instead of streaming it
        #[arg(long)]
        json: bool,
    },

    /// Report a shell event to the daemon (used by the shell integration)
    #[command(hide = true)]
    Hook {
        event: ShellEvent,

        /// Working directory (defaults to the current directory)
        #[arg(long)]
        cwd: Option<String>,

        /// Command line about to run (preexec)
        #[arg(long)]
        command: Option<String>,

        /// Exit code of the last command (precmd)
        #[arg(long)]
        exit_code: Option<i32>,

        /// Git branch; detected from the working directory when omitted
        #[arg(long)]
        git_branch: Option<String>,

        /// Mark the git worktree as dirty
        #[arg(long, requires = "git_branch")]
        git_dirty: bool,
    },

    /// Discard the current session and start a new one
    NewSession {
        #[arg(long)]
        json: bool,
    },

    /// Show daemon and session status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List configured agents
    Agents {
        #[arg(long)]
        json: bool,
    },

    /// Check that the daemon is responding
    Ping {
        #[arg(long)]
        json: bool,
    },

    /// Start the daemon in the background
    Start,

    /// Stop the running daemon
    Stop,

    /// Install or uninstall the shell hooks
    ShellIntegration {
        #[arg(long)]
        install: bool,

        #[arg(long, conflicts_with = "install")]
        uninstall: bool,

        /// Shell to configure (detected from $SHELL when omitted)
        #[arg(long)]
        shell: Option<ShellType>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let base = Config::from_env();
    let config_file = cli.config.unwrap_or_else(|| base.config_file.clone());
    let settings = Settings::load(&config_file)?;
    let config = settings.apply_paths(base);

    match cli.command {
        Commands::Ask {
            prompt,
            agent,
            template,
            new_session,
            timeout,
            json,
        } => {
            let prompt = prompt.join(" ");
            let prompt = match template {
                Some(name) => settings
                    .render_template(&name, &prompt)
                    .ok_or_else(|| anyhow!("Unknown template: {}", name))?,
                None => prompt,
            };
            let request = DaemonRequest::Query(QueryPayload {
                prompt,
                agent,
                pipe_input: read_piped_stdin()?,
                cwd: current_dir(),
                new_session: new_session.then_some(true),
            });
            ensure_daemon(&config, &config_file).await?;
            let client = DaemonClient::new(config).with_timeout(Duration::from_secs(timeout));
            ask(&client, &request, json).await
        }

        Commands::Hook {
            event,
            cwd,
            command,
            exit_code,
            git_branch,
            git_dirty,
        } => {
            let cwd = cwd.unwrap_or_else(current_dir);
            let (git_branch, git_dirty) = match git_branch {
                Some(branch) => (Some(branch), Some(git_dirty)),
                // preexec stays cheap; git state is refreshed at the prompt
                None if event != ShellEvent::Preexec => git_state(Path::new(&cwd)),
                None => (None, None),
            };
            let request = DaemonRequest::ContextUpdate(ContextUpdatePayload {
                event,
                command,
                exit_code,
                cwd,
                git_branch,
                git_dirty,
            });
            let client = DaemonClient::new(config).with_timeout(HOOK_TIMEOUT);
            // Hooks run inside the user's prompt: failures are logged, never reported
            if let Err(e) = client.send(&request).await {
                debug!(error = %e, "hook not delivered");
            }
            Ok(())
        }

        Commands::NewSession { json } => {
            let request = DaemonRequest::NewSession(NewSessionPayload {
                cwd: Some(current_dir()),
            });
            simple_request(&config, &request, json, |data| println!("{}", data)).await
        }

        Commands::Status { json } => {
            simple_request(&config, &DaemonRequest::Status, json, print_status).await
        }

        Commands::Agents { json } => {
            simple_request(&config, &DaemonRequest::Agents, json, print_agents).await
        }

        Commands::Ping { json } => {
            simple_request(&config, &DaemonRequest::Ping, json, |data| println!("{}", data)).await
        }

        Commands::Start => {
            if daemon_ready(&config) {
                println!("Daemon already running (PID: {})", pid_text(&config));
                return Ok(());
            }
            start_daemon(&config, &config_file).await?;
            println!("Daemon started (PID: {})", pid_text(&config));
            Ok(())
        }

        Commands::Stop => stop_daemon(&config).await,

        Commands::ShellIntegration {
            install,
            uninstall,
            shell,
        } => shell_integration_command(install, uninstall, shell),
    }
}

/// Run a query, streaming chunks to stdout as they arrive
async fn ask(client: &DaemonClient, request: &DaemonRequest, json: bool) -> Result<()> {
    let mut stdout = io::stdout();
    let mut ends_with_newline = true;

    let result = client
        .send_streaming(request, |frame| {
            if json {
                return;
            }
            if let DaemonResponse::Chunk { data } | DaemonResponse::Status { data } = frame {
                if data.is_empty() {
                    return;
                }
                // A closed stdout (e.g. `| head`) must not abort the query
                let _ = stdout.write_all(data.as_bytes());
                let _ = stdout.flush();
                ends_with_newline = data.ends_with('\n');
            }
        })
        .await;

    if json {
        return print_json_result(result);
    }

    if !ends_with_newline {
        println!();
    }
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("Error: {}", describe_error(&e));
            std::process::exit(1);
        }
    }
}

/// Send a non-streaming request and hand the result text to `print`
async fn simple_request<F>(config: &Config, request: &DaemonRequest, json: bool, print: F) -> Result<()>
where
    F: FnOnce(&str),
{
    let client = DaemonClient::new(config.clone()).with_timeout(DEFAULT_TIMEOUT);
    let result = client.send(request).await;

    if json {
        return print_json_result(result);
    }

    match result {
        Ok(data) => {
            print(data.as_deref().unwrap_or(""));
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", describe_error(&e));
            std::process::exit(1);
        }
    }
}

fn print_json_result(result: Result<Option<String>, ClientError>) -> Result<()> {
    let outcome = ClientResult::from(result);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn describe_error(e: &ClientError) -> String {
    match e {
        ClientError::DaemonNotRunning => {
            "ambient daemon is not running. Start it with: ambient start".to_string()
        }
        ClientError::Timeout => "timed out waiting for the daemon".to_string(),
        other => other.to_string(),
    }
}

fn print_status(data: &str) {
    let Ok(status) = serde_json::from_str::<Value>(data) else {
        println!("{}", data);
        return;
    };

    println!(
        "Daemon running (PID: {}, up {}s)",
        status["pid"], status["uptimeSecs"]
    );
    println!("Socket: {}", status["socketPath"].as_str().unwrap_or("?"));
    println!(
        "Default agent: {}",
        status["defaultAgent"].as_str().unwrap_or("?")
    );
    println!("Queries in flight: {}", status["inFlight"]);

    match status.get("session").filter(|s| !s.is_null()) {
        Some(session) => {
            println!(
                "Session: {} ({} queries since {})",
                session["agentName"].as_str().unwrap_or("?"),
                session["queryCount"],
                session["startedAt"].as_str().unwrap_or("?")
            );
        }
        None => println!("Session: none"),
    }
}

fn print_agents(data: &str) {
    let Ok(Value::Array(agents)) = serde_json::from_str::<Value>(data) else {
        println!("{}", data);
        return;
    };

    for agent in agents {
        let marker = if agent["default"].as_bool().unwrap_or(false) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<12} {}",
            marker,
            agent["name"].as_str().unwrap_or("?"),
            agent["command"].as_str().unwrap_or("?")
        );
    }
}

/// Read stdin when it is piped; `None` for a terminal or empty input
fn read_piped_stdin() -> Result<Option<String>> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    stdin
        .lock()
        .read_to_string(&mut input)
        .context("Failed to read piped input")?;

    Ok(if input.trim().is_empty() {
        None
    } else {
        Some(input)
    })
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

/// Branch and dirty flag of the git worktree containing `cwd`
fn git_state(cwd: &Path) -> (Option<String>, Option<bool>) {
    let git = |args: &[&str]| {
        Command::new("git")
            .arg("-C")
            .arg(cwd)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
    };

    match git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
        Some(branch) if !branch.is_empty() => {
            let dirty = git(&["status", "--porcelain"]).map(|out| !out.is_empty());
            (Some(branch), dirty)
        }
        _ => (None, None),
    }
}

fn daemon_ready(config: &Config) -> bool {
    config.is_alive() && config.socket_exists()
}

fn pid_text(config: &Config) -> String {
    config
        .read_pid()
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Start the daemon unless it is already running
async fn ensure_daemon(config: &Config, config_file: &Path) -> Result<()> {
    if daemon_ready(config) {
        return Ok(());
    }
    eprintln!("Daemon not running, starting it...");
    start_daemon(config, config_file).await
}

/// Find the daemon binary: next to this executable, else on PATH
fn resolve_daemon_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ambient-daemon")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("ambient-daemon"))
}

/// Spawn the daemon detached, logging to ~/.ambient/daemon.log, and wait until it is ready
async fn start_daemon(config: &Config, config_file: &Path) -> Result<()> {
    use std::os::unix::process::CommandExt;

    config
        .ensure_dirs()
        .context("Failed to create data directory")?;

    let log_path = config.log_file();
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    let daemon_path = resolve_daemon_path();
    Command::new(&daemon_path)
        .arg("--config")
        .arg(config_file)
        .arg("--socket")
        .arg(&config.socket_path)
        .env(ambient_lib::session::config::HOME_ENV, &config.home_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        // Own process group so terminal signals aimed at this shell miss the daemon
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to start daemon at {}", daemon_path.display()))?;

    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        if daemon_ready(config) {
            return Ok(());
        }
    }

    Err(anyhow!(
        "Daemon did not start within {}s (see {})",
        START_TIMEOUT.as_secs(),
        log_path.display()
    ))
}

async fn stop_daemon(config: &Config) -> Result<()> {
    let Some(pid) = config.read_pid().filter(|_| config.is_alive()) else {
        println!("Daemon is not running");
        return Ok(());
    };

    let client = DaemonClient::new(config.clone()).with_timeout(DEFAULT_TIMEOUT);
    if let Err(e) = client.send(&DaemonRequest::Shutdown).await {
        warn!(error = %e, "shutdown request failed");
        eprintln!("Error: {}", describe_error(&e));
        std::process::exit(1);
    }

    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    while ambient_lib::session::config::pid_is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("Daemon (PID: {}) did not exit in time", pid));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    println!("Daemon stopped");
    Ok(())
}

fn shell_integration_command(install: bool, uninstall: bool, shell: Option<ShellType>) -> Result<()> {
    let shell_type = match shell {
        Some(shell) => shell,
        None => ShellType::detect().ok_or_else(|| {
            anyhow!(
                "Could not detect shell type from $SHELL. \
                 Please specify with --shell <zsh|bash|fish>"
            )
        })?,
    };

    let rc_path = shell_type.rc_file_path()?;

    if uninstall {
        if shell_integration::uninstall(&rc_path)? {
            println!("Removed ambient hooks from {}", rc_path.display());
            println!("Restart your shell or run: source {}", rc_path.display());
        } else {
            println!("ambient hooks were not installed in {}", rc_path.display());
        }
    } else if install {
        let installed_path = shell_integration::install(shell_type, Some(rc_path))?;
        println!("Installed ambient hooks to {}", installed_path.display());
        println!();
        println!("Restart your shell or run: source {}", installed_path.display());
        println!("Commands, exit codes and directory changes will now reach the daemon.");
    } else {
        let installed = shell_integration::is_installed(&rc_path)?;
        println!("Shell: {}", shell_type);
        println!("RC file: {}", rc_path.display());
        println!(
            "Status: {}",
            if installed {
                "installed"
            } else {
                "not installed"
            }
        );
        println!();
        if installed {
            println!("To uninstall: ambient shell-integration --uninstall");
        } else {
            println!("To install: ambient shell-integration --install");
        }
    }
    Ok(())
}
