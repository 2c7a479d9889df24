//! errloop CLI.
//!
//! `errloop hook <event>` is what the host agent runs; every other command is
//! for humans inspecting or steering the learned rules.

#![forbid(unsafe_code)]

mod output;

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use errloop_core::config::{self, LoggingConfig};
use errloop_core::curate::{self, CurateMode, CurateOptions};
use errloop_core::hook::{self, HookEvent};
use errloop_core::ledger::{self, LedgerStats};
use errloop_core::logging::{self, LogSink, LoggingError};
use errloop_core::packs;
use errloop_core::workspace::{self, Workspace};
use serde::Serialize;
use serde_json::json;

use crate::output::OutputFormat;

/// Learn prevention rules from repeated agent command failures.
#[derive(Parser, Debug)]
#[command(name = "errloop", author, version, about, long_about = None)]
struct Cli {
    /// errloop home directory (config, ledger, packs)
    #[arg(long, env = "ERRLOOP_HOME", global = true)]
    home: Option<PathBuf>,

    /// Config file (default: <home>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain, global = true)]
    format: OutputFormat,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handle a host hook trigger (payload on stdin)
    Hook {
        /// pre-tool-use, post-tool-use, post-tool-use-failure or session-end
        /// (the host's PreToolUse style names are accepted too)
        #[arg(value_parser = parse_hook_event)]
        event: HookEvent,
    },

    #[command(flatten)]
    Manage(ManageCommand),
}

#[derive(Subcommand, Debug)]
enum ManageCommand {
    /// Create a starter config, custom pack and allowlist
    Init,

    /// Evaluate a command against the active ruleset
    Check {
        /// Tool the command would run through
        #[arg(long, default_value = "Bash")]
        tool: String,

        /// Also report the rule count and patterns the engine could not compile
        #[arg(long)]
        explain: bool,

        /// Command text
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Promote repeated failures into learned rules
    Curate {
        /// Promote every learnable signature regardless of threshold
        #[arg(long, conflicts_with = "signature")]
        all: bool,

        /// Promote one signature (as shown by `review`)
        #[arg(long)]
        signature: Option<String>,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// List failure signatures and their promotion status
    Review,

    /// Manage rule packs
    Packs {
        #[command(subcommand)]
        action: PacksAction,
    },

    /// Inspect the failure ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand, Debug)]
enum PacksAction {
    /// Show known packs and whether they are enabled
    List,
    /// Enable a pack and rebuild the active ruleset
    Enable { name: String },
    /// Disable a pack and rebuild the active ruleset
    Disable { name: String },
    /// Rebuild the active ruleset from enabled packs
    Rebuild,
}

#[derive(Subcommand, Debug)]
enum LedgerAction {
    /// Counts of failures, fixes, links and skipped lines
    Stats,
}

fn parse_hook_event(name: &str) -> Result<HookEvent, String> {
    HookEvent::parse(name).ok_or_else(|| format!("unknown hook event '{name}'"))
}

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() && is_hook_invocation(&args) => {
            return reject_hook_args(&e, &args);
        }
        Err(e) => e.exit(),
    };

    match &cli.command {
        Commands::Hook { event } => run_hook(&cli, *event),
        Commands::Manage(command) => match run(&cli, command) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Whether argv names the `hook` subcommand, looking past global options.
fn is_hook_invocation(args: &[OsString]) -> bool {
    let mut args = args.iter().skip(1).map(|arg| arg.to_string_lossy());
    while let Some(arg) = args.next() {
        match arg.as_ref() {
            "--home" | "--config" | "--format" => {
                args.next();
            }
            flag if flag.starts_with('-') => {}
            subcommand => return subcommand == "hook",
        }
    }
    false
}

/// `--home` as written in argv, for when clap could not parse the rest.
fn raw_home_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut args = args.iter().skip(1);
    while let Some(arg) = args.next() {
        let text = arg.to_string_lossy();
        if text == "--home" {
            return args.next().map(PathBuf::from);
        }
        if let Some(home) = text.strip_prefix("--home=") {
            return Some(PathBuf::from(home));
        }
    }
    None
}

/// Bad hook arguments are a host misconfiguration. Clap would exit 2, which
/// the host reads as a block, so log the error and allow instead.
fn reject_hook_args(error: &clap::Error, args: &[OsString]) -> ExitCode {
    let home = raw_home_arg(args)
        .or_else(|| std::env::var_os("ERRLOOP_HOME").map(PathBuf::from))
        .unwrap_or_else(workspace::default_home);
    init_hook_logging(
        &LoggingConfig::default(),
        0,
        home.join(config::PathsConfig::default().log_file),
    );
    tracing::warn!(error = %error, "Invalid hook arguments, allowing");
    ExitCode::SUCCESS
}

/// Route hook logs to the log file. Stderr is reserved for block text, so a
/// hook that cannot open its log runs unlogged.
fn init_hook_logging(settings: &LoggingConfig, verbose: u8, log_file: PathBuf) {
    let sink = LogSink::File(log_file);
    match logging::init_logging(settings, verbose, &sink) {
        Ok(()) | Err(LoggingError::LogFile { .. } | LoggingError::AlreadyInitialized) => {}
        Err(LoggingError::InvalidFilter { directive, reason }) => {
            if logging::init_logging(&LoggingConfig::default(), 0, &sink).is_ok() {
                tracing::warn!(
                    directive = %directive,
                    reason = %reason,
                    "Invalid log filter, using defaults"
                );
            }
        }
    }
}

fn home_dir(cli: &Cli) -> PathBuf {
    cli.home.clone().unwrap_or_else(workspace::default_home)
}

/// Hook mode: logs go to the log file, stderr carries only block text, and
/// every failure exits 0.
fn run_hook(cli: &Cli, event: HookEvent) -> ExitCode {
    let home = home_dir(cli);
    let ws = match Workspace::load(&home, cli.config.as_deref()) {
        Ok(ws) => ws,
        Err(e) => {
            init_hook_logging(
                &LoggingConfig::default(),
                cli.verbose,
                home.join(config::PathsConfig::default().log_file),
            );
            tracing::warn!(error = %e, "Cannot load workspace, allowing");
            return ExitCode::SUCCESS;
        }
    };
    init_hook_logging(&ws.config.logging, cli.verbose, ws.paths.log_file.clone());

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        tracing::warn!(error = %e, "Cannot read hook payload, allowing");
        return ExitCode::SUCCESS;
    }

    let outcome = hook::dispatch(&ws, event, &raw, Utc::now());
    if let Some(text) = &outcome.stderr {
        eprintln!("{text}");
    }
    u8::try_from(outcome.exit_code).map_or(ExitCode::SUCCESS, ExitCode::from)
}

fn run(cli: &Cli, command: &ManageCommand) -> anyhow::Result<ExitCode> {
    let home = home_dir(cli);
    let ws = Workspace::load(&home, cli.config.as_deref())
        .with_context(|| format!("loading errloop home {}", home.display()))?;
    if let Err(e) = logging::init_logging(&ws.config.logging, cli.verbose, &LogSink::Stderr) {
        eprintln!("warning: {e}");
    }
    tracing::debug!(home = %home.display(), "Loaded workspace");

    match command {
        ManageCommand::Init => cmd_init(cli, &ws),
        ManageCommand::Check {
            tool,
            explain,
            command,
        } => cmd_check(cli, &ws, tool, *explain, &command.join(" ")),
        ManageCommand::Curate {
            all,
            signature,
            dry_run,
        } => {
            let mode = match (signature, all) {
                (Some(signature), _) => CurateMode::Signature(signature.clone()),
                (None, true) => CurateMode::All,
                (None, false) => CurateMode::Auto,
            };
            cmd_curate(cli, &ws, mode, *dry_run)
        }
        ManageCommand::Review => {
            let report = curate::review_workspace(&ws).context("building review")?;
            output::emit(cli.format, &report, output::review)?;
            Ok(ExitCode::SUCCESS)
        }
        ManageCommand::Packs { action } => cmd_packs(cli, ws, action),
        ManageCommand::Ledger {
            action: LedgerAction::Stats,
        } => {
            let snapshot = ws.ledger().snapshot().context("reading ledger")?;
            let linked = ledger::reconstruct(&snapshot.entries);
            let stats = LedgerStats::compute(&snapshot, &linked);
            output::emit(cli.format, &stats, output::ledger_stats)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_init(cli: &Cli, ws: &Workspace) -> anyhow::Result<ExitCode> {
    let written = ws.init().context("initializing errloop home")?;
    let files: Vec<String> = written.iter().map(|p| p.display().to_string()).collect();
    let value = json!({ "home": ws.paths.home.display().to_string(), "created": files });
    output::emit(cli.format, &value, |_| {
        if files.is_empty() {
            format!("{} already initialized", ws.paths.home.display())
        } else {
            files.iter().map(|f| format!("created {f}\n")).collect()
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    tool: &'a str,
    command: &'a str,
    blocked: bool,
    #[serde(flatten)]
    verdict: &'a errloop_core::matcher::Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_rules: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    faults: Option<&'a [errloop_core::matcher::EngineFault]>,
}

fn cmd_check(
    cli: &Cli,
    ws: &Workspace,
    tool: &str,
    explain: bool,
    command: &str,
) -> anyhow::Result<ExitCode> {
    let engine = ws.engine().context("loading active ruleset")?;
    let verdict = engine.evaluate(tool, command);
    let out = CheckOutput {
        tool,
        command,
        blocked: verdict.is_blocked(),
        verdict: &verdict,
        active_rules: explain.then(|| engine.rule_count()),
        faults: explain.then(|| engine.faults()),
    };
    output::emit(cli.format, &out, |out| {
        output::verdict(out.verdict, out.active_rules, engine.faults())
    })?;
    Ok(if verdict.is_blocked() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_curate(
    cli: &Cli,
    ws: &Workspace,
    mode: CurateMode,
    dry_run: bool,
) -> anyhow::Result<ExitCode> {
    let options = CurateOptions { mode, dry_run };
    let report = curate::run_curation(ws, &options, Utc::now()).context("curation pass failed")?;
    output::emit(cli.format, &report, output::curation)?;
    if report.summary.unknown_signature.is_some() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_packs(cli: &Cli, ws: Workspace, action: &PacksAction) -> anyhow::Result<ExitCode> {
    match action {
        PacksAction::List => {
            let listing = packs::list_packs(&ws.paths.packs_dir, &ws.config.enabled_packs);
            output::emit(cli.format, &listing, |listing| output::pack_list(listing))?;
        }
        PacksAction::Enable { name } | PacksAction::Disable { name } => {
            let enable = matches!(action, PacksAction::Enable { .. });
            if enable {
                if let Err(e) = packs::load_pack(&ws.paths.packs_dir, name) {
                    bail!("cannot enable '{name}': {e}");
                }
            }
            let changed = config::set_pack_enabled(&ws.paths.config, name, enable)
                .with_context(|| format!("updating {}", ws.paths.config.display()))?;
            let ws = Workspace::load(&ws.paths.home, Some(&ws.paths.config))?;
            let (active, merge) = ws.rebuild_active(Utc::now())?;
            let value = json!({
                "pack": name,
                "enabled": enable,
                "changed": changed,
                "active_rules": active.patterns.len(),
                "merge": merge,
            });
            output::emit(cli.format, &value, |_| {
                let verb = if enable { "enabled" } else { "disabled" };
                let state = if changed { verb.to_string() } else { format!("already {verb}") };
                format!(
                    "{name}: {state}; {} active rule(s)\n{}",
                    active.patterns.len(),
                    output::merge(&merge)
                )
            })?;
        }
        PacksAction::Rebuild => {
            let (active, merge) = ws.rebuild_active(Utc::now())?;
            let value = json!({ "active_rules": active.patterns.len(), "merge": merge });
            output::emit(cli.format, &value, |_| {
                format!(
                    "{} active rule(s) written to {}\n{}",
                    active.patterns.len(),
                    ws.paths.active.display(),
                    output::merge(&merge)
                )
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
