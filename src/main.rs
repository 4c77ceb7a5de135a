//! Shellgate command-line front-end.
//!
//! `shellgate daemon` runs the engine; everything else is a thin client of
//! its sockets: status/stop/reload management verbs, one-shot evaluate and
//! execute, approval verdicts, the observer TUI, the Claude Code hook
//! adapter, and shim installation.

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use shellgate::client::{self, EngineClient};
use shellgate::models::ExecutionContext;
use shellgate::rules::{self, LoadInputs};
use shellgate::settings::{self, EngineConfig, Paths};
use shellgate::{daemon, hook, shim, tui};
use std::io::Read as _;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "shellgate", version = daemon::VERSION)]
#[command(about = "Cooperative safety layer for shell commands")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine in the foreground.
    Daemon,
    /// Ask a running engine to shut down.
    Stop,
    /// Show engine status.
    Status,
    /// Ask the engine to reload its rule files.
    Reload,
    /// Evaluate a command without executing it.
    Check(CommandArgs),
    /// Evaluate a command and, if permitted, execute it.
    Exec(CommandArgs),
    /// Approve a pending approval.
    Approve(VerdictArgs),
    /// Deny a pending approval.
    Deny(VerdictArgs),
    /// Watch the live event stream and resolve approvals interactively.
    Observe,
    /// Claude Code PreToolUse hook adapter (reads hook JSON on stdin).
    Hook,
    /// Manage the shim layer.
    #[command(subcommand)]
    Shim(ShimCommand),
    /// Inspect the layered rule files without a running engine.
    #[command(subcommand)]
    Rules(RulesCommand),
}

#[derive(Args)]
struct CommandArgs {
    /// Working directory for the evaluation (defaults to the current dir).
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Caller identity: "ai" or "human" (defaults to marker detection).
    #[arg(long)]
    context: Option<String>,
    /// Print nothing; communicate through the exit code only.
    #[arg(long)]
    quiet: bool,
    /// The command line to evaluate.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct VerdictArgs {
    /// Approval id (shown in the observer and in STATUS output).
    approval_id: String,
    /// Optional reason passed back to the waiting caller.
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Subcommand)]
enum ShimCommand {
    /// Write the shim script, symlinks, and shell-integration snippet.
    Install {
        /// Commands to intercept (defaults to the configured list).
        commands: Vec<String>,
    },
    /// Remove the shim directory and integration snippet.
    Remove,
    /// Show what is installed and whether the engine is reachable.
    Status,
}

#[derive(Subcommand)]
enum RulesCommand {
    /// Load and validate the layers; report the first error precisely.
    Check,
    /// Print the merged active rule set.
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("shellgate: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let paths = Paths::resolve();

    match cli.command {
        Command::Daemon => run_daemon(paths),
        Command::Stop => {
            let mut engine = EngineClient::connect(&paths)?;
            let ack = engine.shutdown()?;
            anyhow::ensure!(ack.ok, "stop refused: {}", ack.error.unwrap_or_default());
            println!("engine stopping");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let mut engine = EngineClient::connect(&paths)?;
            let status = engine.status()?;
            println!(
                "shellgate {} · {} rules ({}) · uptime {}s · {} connection(s)",
                status.version,
                status.rules_loaded,
                &status.rules_fingerprint[..12.min(status.rules_fingerprint.len())],
                status.uptime_ms / 1000,
                status.active_connections,
            );
            if status.pending_approvals.is_empty() {
                println!("no pending approvals");
            } else {
                println!("pending approvals:");
                for pending in status.pending_approvals {
                    println!(
                        "  {}  {}  (rule {}, expires in {}s)",
                        pending.id, pending.command, pending.rule, pending.expires_in_secs
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Reload => {
            let mut engine = EngineClient::connect(&paths)?;
            let ack = engine.reload_rules()?;
            if ack.ok {
                println!("rules reloaded");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{}", ack.error.unwrap_or_else(|| "reload failed".into()));
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Check(args) => run_check(&paths, args),
        Command::Exec(args) => run_exec(&paths, args),
        Command::Approve(args) => run_verdict(&paths, args, true),
        Command::Deny(args) => run_verdict(&paths, args, false),
        Command::Observe => {
            tui::run_observer(&paths)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Hook => {
            let mut input = String::new();
            // Unreadable stdin is just another reason to fail open.
            let _ = std::io::stdin().read_to_string(&mut input);
            let output = hook::run_hook(&input, &paths);
            println!("{}", serde_json::to_string(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Shim(command) => run_shim(&paths, command),
        Command::Rules(command) => run_rules(&paths, command),
    }
}

fn run_daemon(paths: Paths) -> Result<ExitCode> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SHELLGATE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::load_from(&paths.config())?;
    let engine = daemon::Engine::new(config, paths);

    let runtime = tokio::runtime::Runtime::new().context("start runtime")?;
    runtime.block_on(daemon::run(engine))?;
    Ok(ExitCode::SUCCESS)
}

fn parse_context(value: Option<&str>) -> Result<Option<ExecutionContext>> {
    match value {
        None => Ok(None),
        Some("ai") => Ok(Some(ExecutionContext::Ai)),
        Some("human") => Ok(Some(ExecutionContext::Human)),
        Some(other) => anyhow::bail!("invalid context `{other}` (expected ai or human)"),
    }
}

fn run_check(paths: &Paths, args: CommandArgs) -> Result<ExitCode> {
    let command = args.command.join(" ");
    let context = parse_context(args.context.as_deref())?;
    let params = client::params_from_caller(&command, args.dir, context);

    let mut engine = match EngineClient::connect(paths) {
        Ok(engine) => engine,
        // Engine down: the safety layer is transparently absent.
        Err(_) => {
            if !args.quiet {
                println!("allow (engine not running)");
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    let response = engine.evaluate(params)?;
    if !args.quiet {
        match response.decision.as_str() {
            "allow" => println!("allow"),
            "redirect" => println!(
                "redirect -> {}",
                response.substituted_command.as_deref().unwrap_or("?")
            ),
            decision => println!(
                "{decision} (rule {}): {}",
                response.rule.as_deref().unwrap_or("?"),
                response.message.as_deref().unwrap_or(""),
            ),
        }
    }
    match response.decision.as_str() {
        "allow" | "redirect" => Ok(ExitCode::SUCCESS),
        _ => Ok(ExitCode::FAILURE),
    }
}

fn run_exec(paths: &Paths, args: CommandArgs) -> Result<ExitCode> {
    use std::io::Write as _;

    let command = args.command.join(" ");
    let context = parse_context(args.context.as_deref())?;
    let params = client::params_from_caller(&command, args.dir, context);

    let mut engine = EngineClient::connect(paths)?;
    let response = engine.execute(params)?;

    let stdout = shellgate::protocol::decode_stream(&response.stdout, response.stdout_encoding);
    let stderr = shellgate::protocol::decode_stream(&response.stderr, response.stderr_encoding);
    std::io::stdout().write_all(&stdout)?;
    std::io::stderr().write_all(&stderr)?;

    let code = match response.exit_code {
        Some(code) => u8::try_from(code.rem_euclid(256)).unwrap_or(1),
        None => {
            if response.executed {
                0
            } else {
                1
            }
        }
    };
    Ok(ExitCode::from(code))
}

fn run_verdict(paths: &Paths, args: VerdictArgs, approve: bool) -> Result<ExitCode> {
    let mut engine = EngineClient::connect(paths)?;
    let ack = if approve {
        engine.approve(&args.approval_id, args.message)?
    } else {
        engine.deny(&args.approval_id, args.message)?
    };
    if ack.ok {
        println!(
            "{} {}",
            if approve { "approved" } else { "denied" },
            args.approval_id
        );
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", ack.error.unwrap_or_else(|| "unknown approval".into()));
        Ok(ExitCode::FAILURE)
    }
}

fn run_shim(paths: &Paths, command: ShimCommand) -> Result<ExitCode> {
    let config = EngineConfig::load_from(&paths.config())?;
    match command {
        ShimCommand::Install { commands } => {
            let commands = if commands.is_empty() {
                config.shim_commands.clone()
            } else {
                commands
            };
            let report = shim::install(paths, &commands, &config.wrapped_builtins)?;
            println!("shim script: {}", report.script.display());
            println!("intercepting: {}", report.linked.join(", "));
            println!(
                "add to your shell profile:\n  source \"{}\"",
                report.integration.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        ShimCommand::Remove => {
            shim::remove(paths)?;
            println!("shim removed");
            Ok(ExitCode::SUCCESS)
        }
        ShimCommand::Status => {
            let links = shim::installed_links(paths);
            if links.is_empty() {
                println!("no shims installed");
            } else {
                println!("intercepting: {}", links.join(", "));
            }
            match EngineClient::connect(paths) {
                Ok(_) => println!("engine: reachable"),
                Err(_) => println!("engine: not running (commands pass through)"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_rules(paths: &Paths, command: RulesCommand) -> Result<ExitCode> {
    let global = match std::fs::read_to_string(paths.global_rules()) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).context("read global rules"),
    };
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let repo = match settings::discover_repo_rules(&working_dir) {
        Some(path) => Some(std::fs::read_to_string(&path).context("read repo rules")?),
        None => None,
    };

    let loaded = rules::load(LoadInputs {
        defaults: rules::DEFAULT_RULES,
        global: global.as_deref(),
        repo: repo.as_deref(),
    });

    match (command, loaded) {
        (RulesCommand::Check, Ok(rules)) => {
            println!("ok: {} active rules ({})", rules.len(), rules.fingerprint());
            Ok(ExitCode::SUCCESS)
        }
        (RulesCommand::Check, Err(err)) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
        (RulesCommand::Show, Ok(rules)) => {
            for rule in rules.rules() {
                let commands = if rule.commands.is_empty() {
                    "*".to_string()
                } else {
                    rule.commands.join(",")
                };
                println!(
                    "{:<28} {:<16} [{}] ({})",
                    rule.name,
                    rule.action.as_str(),
                    commands,
                    rule.source_layer,
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        (RulesCommand::Show, Err(err)) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}
