//! Top-level CLI definition and dispatch.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use schematic_sync_portal::core::config::Config;
use schematic_sync_portal::core::errors::SspError;
use schematic_sync_portal::core::paths::{relative_within, resolve_absolute_path};
use schematic_sync_portal::logger::dual::{
    ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, spawn_logger,
};
use schematic_sync_portal::logger::sqlite::SqliteLogger;
use schematic_sync_portal::platform::pal::{
    HostOs, JobSpec, RecurringJobInstaller, ScheduleActionResult, select_installer,
};
use schematic_sync_portal::platform::signals::InterruptFlag;
use schematic_sync_portal::shield::engine::{ArchiveEngine, ExternalArchiver};
use schematic_sync_portal::shield::ledger::ExclusionLedger;
use schematic_sync_portal::shield::protection::ProtectionRules;
use schematic_sync_portal::shield::sweep::{
    ArchiveOutcome, ArchiveRecord, Disposal, SweepConfig, SweepOrchestrator, SweepPolicy,
    SweepReport,
};
use schematic_sync_portal::sync::auth::{AuthProvider, CopypartyAuth};
use schematic_sync_portal::sync::deps::{
    DependencyChecker, DependencyReport, InstallOutcome, Requirement,
};
use schematic_sync_portal::sync::rclone::{ManifestCheck, RcloneSync};

/// Schematic Sync Portal: mirror a schematic share and keep it free of risky tooling.
#[derive(Debug, Parser)]
#[command(
    name = "ssp",
    author,
    version,
    about = "Schematic Sync Portal - share mirror with archive shield",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Interactive configuration: dependencies, remote, credentials, schedule.
    Setup(SetupArgs),
    /// Log in, mirror the remote share, then sweep the mirror.
    Sync(SyncArgs),
    /// Run only the archive shield over a directory tree.
    Sweep(SweepArgs),
    /// List and classify one archive without touching it.
    Classify(ClassifyArgs),
    /// Report required and optional external tools.
    Doctor(DoctorArgs),
    /// Manage the weekly sync job.
    Schedule(ScheduleArgs),
    /// Inspect or reset the exclusion ledger.
    Ledger(LedgerArgs),
    /// Show recent activity from the SQLite log.
    History(HistoryArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
    /// Show version and build metadata.
    Version,
}

#[derive(Debug, Clone, Args, Default)]
struct SetupArgs {
    /// Remote share URL (prompted when omitted).
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    /// Remote username (prompted when omitted).
    #[arg(long)]
    username: Option<String>,
    /// Local mirror directory (prompted when omitted).
    #[arg(long, value_name = "DIR")]
    local_dir: Option<PathBuf>,
    /// Install the weekly sync job without asking.
    #[arg(long, conflicts_with = "no_schedule")]
    schedule: bool,
    /// Never install the weekly sync job.
    #[arg(long)]
    no_schedule: bool,
    /// Skip the dependency check.
    #[arg(long)]
    skip_doctor: bool,
    /// Accept defaults for every prompt.
    #[arg(short, long)]
    yes: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct SyncArgs {
    /// Do not run the archive shield after the mirror.
    #[arg(long)]
    no_shield: bool,
    /// Skip the remote manifest check.
    #[arg(long)]
    skip_manifest: bool,
    /// Run the post-sync sweep without modifying anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct SweepArgs {
    /// Sweep root (defaults to the configured local directory).
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,
    /// Classify and report without extracting, deleting, or writing the ledger.
    #[arg(long)]
    dry_run: bool,
    /// What to do with garbage archives after the rescue.
    #[arg(long, value_name = "POLICY")]
    policy: Option<SweepPolicy>,
    /// Worker threads (>= 1).
    #[arg(long, value_name = "N")]
    parallelism: Option<usize>,
    /// Create the ledger file first instead of skipping ledger writes.
    #[arg(long)]
    create_ledger: bool,
}

#[derive(Debug, Clone, Args)]
struct ClassifyArgs {
    /// Archive to inspect.
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,
    /// Base directory for protection markers (defaults to the local directory).
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Offer to install missing tools where an installer exists.
    #[arg(long)]
    fix: bool,
}

#[derive(Debug, Clone, Args)]
struct ScheduleArgs {
    #[command(subcommand)]
    command: ScheduleCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ScheduleCommand {
    /// Install (or replace) the weekly sync job.
    Install,
    /// Remove the weekly sync job.
    Uninstall,
    /// Show the scheduler's view of the job.
    Status,
}

#[derive(Debug, Clone, Args)]
struct LedgerArgs {
    #[command(subcommand)]
    command: Option<LedgerCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum LedgerCommand {
    /// Print every ledger entry.
    Show,
    /// Print the ledger file path.
    Path,
    /// Truncate the ledger so excluded archives download again.
    Reset(LedgerResetArgs),
}

#[derive(Debug, Clone, Args)]
struct LedgerResetArgs {
    /// Confirm the reset.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    /// Number of rows to show.
    #[arg(long, default_value_t = 20)]
    limit: u32,
    /// Only show one event type (e.g. archive_purged, sync_failed).
    #[arg(long, value_name = "EVENT")]
    event: Option<String>,
    /// Delete rows older than this many days before listing.
    #[arg(long, value_name = "DAYS")]
    prune_days: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration (password masked).
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<SspError> for CliError {
    fn from(err: SspError) -> Self {
        match err {
            SspError::InvalidConfig { .. }
            | SspError::MissingConfig { .. }
            | SspError::ConfigParse { .. }
            | SspError::UnsafeRoot { .. } => Self::User(err.to_string()),
            SspError::Serialization { .. } => Self::Internal(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Setup(args) => run_setup(cli, args),
        Command::Sync(args) => run_sync(cli, args),
        Command::Sweep(args) => run_sweep(cli, args),
        Command::Classify(args) => run_classify(cli, args),
        Command::Doctor(args) => run_doctor(cli, args),
        Command::Schedule(args) => run_schedule(cli, args),
        Command::Ledger(args) => run_ledger(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
        Command::Version => emit_version(cli),
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_path)
}

// ---------------------------------------------------------------------------
// Activity logger lifetime
// ---------------------------------------------------------------------------

/// Logger thread owned by one command; flushed and joined on drop.
struct LoggerSession {
    handle: Option<ActivityLoggerHandle>,
    join: Option<JoinHandle<()>>,
}

impl LoggerSession {
    fn start(config: &Config) -> Self {
        match spawn_logger(DualLoggerConfig::from_paths(&config.paths)) {
            Ok((handle, join)) => Self {
                handle: Some(handle),
                join: Some(join),
            },
            Err(e) => {
                eprintln!("[SSP-LOG] activity logger unavailable: {e}");
                Self {
                    handle: None,
                    join: None,
                }
            }
        }
    }

    fn handle(&self) -> Option<ActivityLoggerHandle> {
        self.handle.clone()
    }

    fn send(&self, event: ActivityEvent) {
        if let Some(handle) = &self.handle {
            handle.send(event);
        }
    }
}

impl Drop for LoggerSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let dropped = handle.dropped_events();
            handle.shutdown();
            if dropped > 0 {
                eprintln!("[SSP-LOG] {dropped} activity event(s) dropped under back-pressure");
            }
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

fn run_sweep(cli: &Cli, args: &SweepArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    let mut sweep_config = SweepConfig::from_config(&config)?;
    sweep_config.dry_run = args.dry_run;
    if let Some(policy) = args.policy {
        sweep_config.policy = policy;
    }
    if let Some(parallelism) = args.parallelism {
        if parallelism == 0 {
            return Err(CliError::User("--parallelism must be >= 1".to_string()));
        }
        sweep_config.parallelism = parallelism;
    }
    if args.create_ledger {
        sweep_config.create_ledger = true;
    }
    let root = args
        .path
        .clone()
        .unwrap_or_else(|| config.paths.local_dir.clone());

    let logger = LoggerSession::start(&config);
    let engine = match discover_engine(&logger) {
        Ok(engine) => engine,
        Err(e) => {
            if mode == OutputMode::Json {
                write_json_line(&json!({
                    "command": "sweep",
                    "skipped": true,
                    "reason": e.to_string(),
                }))?;
            }
            return Err(e);
        }
    };
    let interrupt = InterruptFlag::install();
    let report = execute_sweep(&config, &engine, &root, sweep_config, &logger, &interrupt)?;

    match mode {
        OutputMode::Human => print_sweep_report(cli, &report),
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "sweep",
                "report": serde_json::to_value(&report)?,
            }))?;
        }
    }
    sweep_exit_status(&report)
}

/// Pick the archive tool once for the whole run; logged once when absent.
fn discover_engine(logger: &LoggerSession) -> Result<ExternalArchiver, CliError> {
    ExternalArchiver::discover().map_err(|e| {
        if let SspError::EngineUnavailable { searched } = &e {
            logger.send(ActivityEvent::EngineUnavailable {
                searched: searched.clone(),
            });
        }
        CliError::Runtime(format!("archive shield skipped: {e}"))
    })
}

fn execute_sweep(
    config: &Config,
    engine: &dyn ArchiveEngine,
    root: &Path,
    sweep_config: SweepConfig,
    logger: &LoggerSession,
    interrupt: &InterruptFlag,
) -> Result<SweepReport, CliError> {
    let ledger = ExclusionLedger::new(&config.paths.ledger_file);
    let orchestrator = SweepOrchestrator::new(engine, &ledger, sweep_config)
        .with_logger(logger.handle())
        .with_cancel_flag(interrupt.shared());
    Ok(orchestrator.run(root)?)
}

fn sweep_exit_status(report: &SweepReport) -> Result<(), CliError> {
    if !report.completed {
        return Err(CliError::Partial(format!(
            "sweep interrupted; {} archive(s) left unscanned",
            report.unscanned.len()
        )));
    }
    let failures = report.failure_count();
    if failures > 0 {
        return Err(CliError::Partial(format!(
            "sweep finished with {failures} failure(s)"
        )));
    }
    Ok(())
}

fn print_sweep_report(cli: &Cli, report: &SweepReport) {
    if !cli.quiet {
        println!(
            "Sweeping {} (policy: {}, engine: {}{})",
            report.root.display(),
            report.policy,
            report.engine,
            if report.dry_run { ", dry run" } else { "" }
        );
    }
    for record in &report.records {
        print_archive_line(cli, record);
    }

    let headline = if report.dry_run {
        format!(
            "Dry run: {} archive(s), {} would be {}.",
            report.scanned,
            report.flagged,
            if report.policy == SweepPolicy::Isolate { "isolated" } else { "purged" }
        )
    } else {
        format!(
            "Sweep complete: {} archive(s), {} purged, {} isolated, {} safe, {} protected, {} failure(s) in {}.",
            report.scanned,
            report.purged,
            report.isolated,
            report.safe,
            report.protected,
            report.failure_count(),
            format_duration(report.elapsed)
        )
    };
    if report.failure_count() > 0 {
        println!("{}", headline.yellow());
    } else {
        println!("{}", headline.green());
    }
    if cli.verbose && report.extraction_attempts > 0 {
        println!(
            "  Rescue: {} of {} extraction call(s) extracted files.",
            report.extraction_successes, report.extraction_attempts
        );
    }
    if report.ledger_skips > 0 {
        println!(
            "{} ledger file missing; {} purge(s) not recorded. Run `ssp setup` or set shield.create_ledger = true.",
            "[WARN]".yellow().bold(),
            report.ledger_skips
        );
    }
    if !report.completed {
        println!(
            "{} {} archive(s) left unscanned.",
            "[INTERRUPTED]".yellow().bold(),
            report.unscanned.len()
        );
    }
}

fn print_archive_line(cli: &Cli, record: &ArchiveRecord) {
    let rel = record.archive.relative_slash();
    let outcome = &record.outcome;
    let is_error = matches!(
        outcome,
        ArchiveOutcome::InspectFailed { .. }
            | ArchiveOutcome::LedgerFailed { .. }
            | ArchiveOutcome::GarbagePurged {
                disposal: Disposal::Failed { .. },
                ..
            }
    );
    if cli.quiet && !is_error {
        return;
    }

    let tag = outcome_tag(outcome);
    let colored_tag = match tag {
        "[SKIP]" | "[KEEP]" => tag.yellow().bold(),
        "[SAFE]" => tag.green().bold(),
        "[PURGE]" => tag.magenta().bold(),
        "[ISOLATE]" => tag.blue().bold(),
        "[DRY-RUN]" => tag.cyan().bold(),
        _ => tag.red().bold(),
    };

    let detail = match outcome {
        ArchiveOutcome::Protected { reason } => format!("{rel} ({reason})"),
        ArchiveOutcome::Safe { verdict, safe_hit } => match safe_hit {
            Some(hit) => format!("{rel} ({verdict}: {hit})"),
            None => format!("{rel} ({verdict})"),
        },
        ArchiveOutcome::InspectFailed {
            message, retryable, ..
        } => format!("{rel}: {message}{}", retry_hint(*retryable)),
        ArchiveOutcome::GarbagePurged {
            rule,
            rescue,
            disposal,
            ..
        } => {
            let rescued = format!(
                "rescued {}/{}, {} absent",
                rescue.extracted_count(),
                rescue.attempt_count(),
                rescue.not_found_count()
            );
            match disposal {
                Disposal::Deleted => format!("{rel} ({}; {rescued})", rule_label(rule.as_deref())),
                Disposal::Isolated { destination } => {
                    format!("{rel} -> {} ({rescued})", destination.display())
                }
                Disposal::Failed {
                    message, retryable, ..
                } => format!(
                    "{rel}: could not remove after rescue: {message}{}",
                    retry_hint(*retryable)
                ),
            }
        }
        ArchiveOutcome::RescueIncomplete { rescue, .. } => format!(
            "{rel}: {} extension(s) failed to extract; archive kept",
            rescue.tool_error_count()
        ),
        ArchiveOutcome::LedgerFailed { message, .. } => {
            format!("{rel}: ledger write failed, archive kept: {message}")
        }
        ArchiveOutcome::WouldPurge { rule, policy } => {
            format!("{rel} would be {policy}d ({})", rule_label(rule.as_deref()))
        }
    };
    println!("{colored_tag} {detail}");

    if cli.verbose
        && let Some(rescue) = outcome.rescue()
    {
        for failure in rescue.failures() {
            println!("    extract *{}: {}", failure.extension, failure.outcome.label());
        }
    }
}

fn outcome_tag(outcome: &ArchiveOutcome) -> &'static str {
    match outcome {
        ArchiveOutcome::Protected { .. } => "[SKIP]",
        ArchiveOutcome::Safe { .. } => "[SAFE]",
        ArchiveOutcome::GarbagePurged {
            disposal: Disposal::Deleted,
            ..
        } => "[PURGE]",
        ArchiveOutcome::GarbagePurged {
            disposal: Disposal::Isolated { .. },
            ..
        } => "[ISOLATE]",
        ArchiveOutcome::RescueIncomplete { .. } => "[KEEP]",
        ArchiveOutcome::WouldPurge { .. } => "[DRY-RUN]",
        ArchiveOutcome::InspectFailed { .. }
        | ArchiveOutcome::LedgerFailed { .. }
        | ArchiveOutcome::GarbagePurged {
            disposal: Disposal::Failed { .. },
            ..
        } => "[ERROR]",
    }
}

const fn retry_hint(retryable: bool) -> &'static str {
    if retryable { " (retried next sweep)" } else { "" }
}

fn rule_label(rule: Option<&str>) -> String {
    rule.map_or_else(|| "garbage".to_string(), |r| format!("matched {r:?}"))
}

// ---------------------------------------------------------------------------
// Classify
// ---------------------------------------------------------------------------

fn run_classify(cli: &Cli, args: &ClassifyArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    let archive = resolve_absolute_path(&args.archive);
    if !archive.is_file() {
        return Err(CliError::User(format!(
            "{} is not a file",
            args.archive.display()
        )));
    }
    let sweep_config = SweepConfig::from_config(&config)?;
    let base = resolve_absolute_path(args.root.as_deref().unwrap_or(&config.paths.local_dir));
    let relative = relative_within(&base, &archive)
        .or_else(|| archive.file_name().map(PathBuf::from))
        .unwrap_or_else(|| archive.clone());

    if let Some(reason) = sweep_config.protection.check(&relative, &archive) {
        match mode {
            OutputMode::Human => {
                println!("{} {} ({reason})", "[SKIP]".yellow().bold(), relative.display());
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "classify",
                "archive": archive.to_string_lossy(),
                "protected": true,
                "reason": serde_json::to_value(&reason)?,
            }))?,
        }
        return Ok(());
    }

    let engine = ExternalArchiver::discover()?;
    let listing = engine.list_entries(&archive)?;
    let result = sweep_config.rules.classifier().classify(listing.as_str());

    match mode {
        OutputMode::Human => {
            let tag = if result.warrants_purge() {
                "[PURGE]".magenta().bold()
            } else {
                "[SAFE]".green().bold()
            };
            println!("{tag} {} ({})", relative.display(), result.label());
            if let Some(hit) = &result.garbage_hit {
                println!("  garbage pattern: {hit}");
            }
            if let Some(hit) = &result.safe_hit {
                println!("  safe pattern: {hit}");
            }
            if result.warrants_purge() {
                let keep_set = sweep_config.rules.keep_extension_set();
                let keep: Vec<&str> = keep_set.iter().collect();
                println!("  a sweep would rescue: {}", keep.join(" "));
            }
            if cli.verbose {
                println!("  engine: {}", engine.describe());
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "classify",
            "archive": archive.to_string_lossy(),
            "protected": false,
            "engine": engine.describe(),
            "verdict": result.label(),
            "warrants_purge": result.warrants_purge(),
            "classification": serde_json::to_value(&result)?,
        }))?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

fn run_sync(cli: &Cli, args: &SyncArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    if !config.remote.is_configured() {
        return Err(CliError::User(
            "no remote configured; run `ssp setup` or set SSP_REMOTE_URL".to_string(),
        ));
    }

    let logger = LoggerSession::start(&config);
    let interrupt = InterruptFlag::install();
    let sync = RcloneSync::from_config(&config);
    let remote = sync.remote_spec();
    logger.send(ActivityEvent::SyncStarted {
        remote: remote.clone(),
        local_dir: config.paths.local_dir.to_string_lossy().into_owned(),
    });
    let fail = |e: SspError| {
        logger.send(ActivityEvent::SyncFailed {
            remote: remote.clone(),
            error_code: e.code().to_string(),
            error_message: e.to_string(),
        });
        CliError::Runtime(e.to_string())
    };

    if mode == OutputMode::Human && !cli.quiet {
        println!("Logging in to {} as {}...", config.remote.url, config.remote.username);
    }
    let header = CopypartyAuth::default()
        .login(
            &config.remote.url,
            &config.remote.username,
            &config.remote.password,
        )
        .map_err(fail)?;

    let manifest = if config.sync.check_manifest && !args.skip_manifest {
        let check = sync.check_manifest(&header);
        if mode == OutputMode::Human && !cli.quiet {
            match check {
                ManifestCheck::Found => println!("Remote manifest found."),
                ManifestCheck::Missing => println!("{} remote manifest.txt not found", "[WARN]".yellow().bold()),
                ManifestCheck::Failed => println!("{} could not check remote manifest", "[WARN]".yellow().bold()),
            }
        }
        Some(manifest_label(check))
    } else {
        None
    };

    if mode == OutputMode::Human && !cli.quiet {
        println!("Mirroring {remote} -> {}", config.paths.local_dir.display());
    }
    let outcome = sync.run(&header).map_err(fail)?;
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = outcome.duration.as_millis() as u64;
    logger.send(ActivityEvent::SyncCompleted {
        remote: outcome.remote.clone(),
        local_dir: outcome.local_dir.to_string_lossy().into_owned(),
        duration_ms,
    });

    let shield_wanted = !args.no_shield && config.sync.run_shield && config.shield.enabled;
    let (shield_state, report) = if !shield_wanted {
        ("disabled", None)
    } else if interrupt.is_set() {
        ("interrupted", None)
    } else {
        match discover_engine(&logger) {
            Ok(engine) => {
                let mut sweep_config = SweepConfig::from_config(&config)?;
                sweep_config.dry_run = args.dry_run;
                let report = execute_sweep(
                    &config,
                    &engine,
                    &config.paths.local_dir,
                    sweep_config,
                    &logger,
                    &interrupt,
                )?;
                ("ran", Some(report))
            }
            Err(e) => {
                if mode == OutputMode::Human {
                    eprintln!("{} {e}", "[WARN]".yellow().bold());
                }
                ("engine_unavailable", None)
            }
        }
    };

    match mode {
        OutputMode::Human => {
            println!(
                "{} {} {} in {}",
                "[SYNC]".green().bold(),
                outcome.verb,
                outcome.remote,
                format_duration(outcome.duration)
            );
            if let Some(report) = &report {
                print_sweep_report(cli, report);
            }
        }
        OutputMode::Json => {
            let report_value = match &report {
                Some(r) => serde_json::to_value(r)?,
                None => Value::Null,
            };
            write_json_line(&json!({
                "command": "sync",
                "remote": outcome.remote,
                "local_dir": outcome.local_dir.to_string_lossy(),
                "log_file": outcome.log_file.to_string_lossy(),
                "verb": outcome.verb,
                "excluded_from_ledger": outcome.excluded_from_ledger,
                "duration_ms": duration_ms,
                "manifest": manifest,
                "shield": shield_state,
                "sweep": report_value,
            }))?;
        }
    }

    match &report {
        Some(report) => sweep_exit_status(report),
        None => Ok(()),
    }
}

const fn manifest_label(check: ManifestCheck) -> &'static str {
    match check {
        ManifestCheck::Found => "found",
        ManifestCheck::Missing => "missing",
        ManifestCheck::Failed => "check_failed",
    }
}

// ---------------------------------------------------------------------------
// Doctor
// ---------------------------------------------------------------------------

fn run_doctor(cli: &Cli, args: &DoctorArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let checker = DependencyChecker::default();
    let mut report = checker.doctor();
    let mut install = None;

    if args.fix && report.tool("rclone").is_some_and(|t| !t.is_present()) {
        let outcome = checker.install_rclone()?;
        if let InstallOutcome::ManualActionRequired { instructions } = &outcome
            && mode == OutputMode::Human
        {
            println!("{} {instructions}", "[MANUAL]".yellow().bold());
        }
        install = Some(outcome);
        report = checker.doctor();
    }

    match mode {
        OutputMode::Human => print_dependency_report(&report),
        OutputMode::Json => write_json_line(&json!({
            "command": "doctor",
            "ok": report.all_required_present(),
            "report": serde_json::to_value(&report)?,
            "install": install.as_ref().map(serde_json::to_value).transpose()?,
        }))?,
    }

    if report.all_required_present() {
        Ok(())
    } else {
        let missing: Vec<&str> = report.missing().map(|t| t.name).collect();
        Err(CliError::Runtime(format!(
            "required tools missing: {}",
            missing.join(", ")
        )))
    }
}

fn print_dependency_report(report: &DependencyReport) {
    println!("Host: {}", report.host);
    for tool in &report.tools {
        let requirement = match tool.requirement {
            Requirement::Required => "required",
            Requirement::Optional => "optional",
        };
        match &tool.path {
            Some(path) => println!(
                "  {} {:<7} {} ({requirement})",
                "[OK]".green().bold(),
                tool.name,
                path.display()
            ),
            None => println!(
                "  {} {:<7} {} ({requirement})",
                "[MISSING]".red().bold(),
                tool.name,
                tool.purpose
            ),
        }
    }
    match &report.archive_engine {
        Some(engine) => println!(
            "Archive shield engine: {} ({})",
            engine.dialect,
            engine.program.display()
        ),
        None => println!(
            "{} no archive tool found; sweeps will be skipped",
            "[WARN]".yellow().bold()
        ),
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

fn run_schedule(cli: &Cli, args: &ScheduleArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let installer = select_installer(HostOs::detect())?;

    match args.command {
        ScheduleCommand::Install => {
            let config = load_config(cli)?;
            let result = install_schedule(cli, &config, installer.as_ref());
            emit_schedule_result(mode, &result)
        }
        ScheduleCommand::Uninstall => {
            let result = schedule_result("uninstall", installer.as_ref(), installer.uninstall());
            emit_schedule_result(mode, &result)
        }
        ScheduleCommand::Status => {
            let status = installer.status()?;
            match mode {
                OutputMode::Human => {
                    println!("Backend: {}", installer.backend());
                    println!("Location: {}", installer.location());
                    println!("{}", status.trim_end());
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "schedule status",
                    "backend": installer.backend(),
                    "location": installer.location(),
                    "status": status,
                }))?,
            }
            Ok(())
        }
    }
}

fn install_schedule(
    cli: &Cli,
    config: &Config,
    installer: &dyn RecurringJobInstaller,
) -> ScheduleActionResult {
    let outcome = JobSpec::weekly_sync(&config.paths.local_dir, cli.config.as_deref())
        .and_then(|job| installer.install(&job));
    let result = schedule_result("install", installer, outcome);
    if result.success {
        let logger = LoggerSession::start(config);
        logger.send(ActivityEvent::ScheduleInstalled {
            backend: result.backend.to_string(),
            path: result.location.clone(),
        });
    }
    result
}

fn schedule_result(
    action: &'static str,
    installer: &dyn RecurringJobInstaller,
    outcome: Result<(), SspError>,
) -> ScheduleActionResult {
    ScheduleActionResult {
        action,
        backend: installer.backend(),
        location: installer.location(),
        success: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    }
}

fn emit_schedule_result(mode: OutputMode, result: &ScheduleActionResult) -> Result<(), CliError> {
    match mode {
        OutputMode::Human => {
            if result.success {
                println!(
                    "{} {} weekly sync ({}: {})",
                    "[OK]".green().bold(),
                    result.action,
                    result.backend,
                    result.location
                );
            } else {
                eprintln!(
                    "{} {} failed ({}): {}",
                    "[ERROR]".red().bold(),
                    result.action,
                    result.backend,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": format!("schedule {}", result.action),
            "result": serde_json::to_value(result)?,
        }))?,
    }
    if result.success {
        Ok(())
    } else {
        Err(CliError::Runtime(format!(
            "schedule {} failed: {}",
            result.action,
            result.error.as_deref().unwrap_or("unknown error")
        )))
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

fn run_ledger(cli: &Cli, args: &LedgerArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    let ledger = ExclusionLedger::new(&config.paths.ledger_file);

    match &args.command {
        None | Some(LedgerCommand::Path) => {
            match mode {
                OutputMode::Human => {
                    println!("{}", ledger.path().display());
                    if !ledger.exists() {
                        println!("  (file does not exist; purges are not being recorded)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "ledger path",
                    "path": ledger.path().to_string_lossy(),
                    "exists": ledger.exists(),
                }))?,
            }
            Ok(())
        }
        Some(LedgerCommand::Show) => {
            let entries = ledger.entries()?;
            match mode {
                OutputMode::Human => {
                    if entries.is_empty() {
                        println!("Ledger is empty.");
                    }
                    for entry in &entries {
                        println!("{entry}");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "ledger show",
                    "path": ledger.path().to_string_lossy(),
                    "exists": ledger.exists(),
                    "count": entries.len(),
                    "entries": entries,
                }))?,
            }
            Ok(())
        }
        Some(LedgerCommand::Reset(reset)) => {
            if !reset.yes {
                return Err(CliError::User(
                    "ledger reset re-enables downloads of every purged archive; pass --yes to confirm"
                        .to_string(),
                ));
            }
            let removed = ledger.reset()?;
            match mode {
                OutputMode::Human => println!("Removed {removed} ledger entr{}.", if removed == 1 { "y" } else { "ies" }),
                OutputMode::Json => write_json_line(&json!({
                    "command": "ledger reset",
                    "path": ledger.path().to_string_lossy(),
                    "removed": removed,
                }))?,
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    let db = &config.paths.sqlite_db;

    let mut pruned = 0;
    let rows = if db.exists() {
        let store = SqliteLogger::open(db)?;
        if let Some(days) = args.prune_days {
            pruned = store.prune_older_than(days)?;
        }
        match args.event.as_deref() {
            Some(event) => store.recent_events(event, args.limit)?,
            None => store.recent_activity(args.limit)?,
        }
    } else {
        Vec::new()
    };

    match mode {
        OutputMode::Human => {
            if pruned > 0 {
                println!("Pruned {pruned} old row(s).");
            }
            if rows.is_empty() {
                println!("No activity recorded yet ({}).", db.display());
            }
            for row in &rows {
                let severity = match row.severity.as_str() {
                    "critical" => row.severity.red().bold(),
                    "warning" => row.severity.yellow(),
                    _ => row.severity.normal(),
                };
                let subject = row
                    .path
                    .as_deref()
                    .or(row.error_message.as_deref())
                    .or(row.details.as_deref())
                    .unwrap_or("");
                println!("{}  {severity:<8}  {:<24}  {subject}", row.timestamp, row.event_type);
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "history",
            "database": db.to_string_lossy(),
            "pruned": pruned,
            "rows": serde_json::to_value(&rows)?,
        }))?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = config_path(cli);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?.redacted();

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let value = serde_json::to_value(&config)?;
                    let payload = json!({
                        "command": "config show",
                        "config": value,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let protection = ProtectionRules::new(
                    &config.shield.protect_markers,
                    &config.shield.protected_paths,
                )?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                        println!("  Rules: {}", config.rules.fingerprint());
                        println!(
                            "  Protection: {} marker(s), {} path pattern(s)",
                            protection.marker_count(),
                            protection.pattern_count()
                        );
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                            "rules_fingerprint": config.rules.fingerprint(),
                            "protect_markers": protection.marker_count(),
                            "protected_patterns": protection.pattern_count(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Line-based prompts on stdin; non-interactive runs take every default.
struct Prompter {
    interactive: bool,
}

impl Prompter {
    fn read_line(&self) -> Result<Option<String>, CliError> {
        let mut buf = String::new();
        let read = io::stdin().lock().read_line(&mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim().to_string()))
    }

    fn ask(&self, label: &str, default: &str) -> Result<String, CliError> {
        if !self.interactive {
            return Ok(default.to_string());
        }
        if default.is_empty() {
            print!("{label}: ");
        } else {
            print!("{label} [{default}]: ");
        }
        io::stdout().flush()?;
        Ok(self
            .read_line()?
            .filter(|answer| !answer.is_empty())
            .unwrap_or_else(|| default.to_string()))
    }

    fn confirm(&self, label: &str, default: bool) -> Result<bool, CliError> {
        if !self.interactive {
            return Ok(default);
        }
        print!("{label} [{}]: ", if default { "Y/n" } else { "y/N" });
        io::stdout().flush()?;
        Ok(match self.read_line()?.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("y" | "yes") => true,
            Some("n" | "no") => false,
            _ => default,
        })
    }

    /// Password prompt; echo is disabled while typing on Unix terminals.
    fn secret(&self, label: &str) -> Result<Option<String>, CliError> {
        if !self.interactive {
            return Ok(None);
        }
        print!("{label}: ");
        io::stdout().flush()?;
        let answer = with_echo_disabled(|| self.read_line())?;
        println!();
        Ok(answer.filter(|a| !a.is_empty()))
    }
}

#[cfg(unix)]
fn with_echo_disabled<T>(read: impl FnOnce() -> Result<T, CliError>) -> Result<T, CliError> {
    use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};

    let stdin = io::stdin();
    let original = tcgetattr(&stdin).ok();
    if let Some(original) = &original {
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        let _ = tcsetattr(&stdin, SetArg::TCSANOW, &silent);
    }
    let result = read();
    if let Some(original) = &original {
        let _ = tcsetattr(&stdin, SetArg::TCSANOW, original);
    }
    result
}

#[cfg(not(unix))]
fn with_echo_disabled<T>(read: impl FnOnce() -> Result<T, CliError>) -> Result<T, CliError> {
    read()
}

fn run_setup(cli: &Cli, args: &SetupArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let prompter = Prompter {
        interactive: !args.yes && io::stdin().is_terminal(),
    };
    let path = config_path(cli);
    let mut config = Config::load(cli.config.as_deref()).or_else(|e| match e {
        SspError::MissingConfig { .. } => Ok(Config::default()),
        other => Err(other),
    })?;

    let mut dependencies = None;
    if !args.skip_doctor {
        let checker = DependencyChecker::default();
        let mut report = checker.doctor();
        if mode == OutputMode::Human {
            print_dependency_report(&report);
        }
        if report.tool("rclone").is_some_and(|t| !t.is_present())
            && prompter.confirm("rclone is missing. Install it now?", false)?
        {
            match checker.install_rclone()? {
                InstallOutcome::Installed => report = checker.doctor(),
                InstallOutcome::ManualActionRequired { instructions } => {
                    println!("{} {instructions}", "[MANUAL]".yellow().bold());
                }
            }
        }
        dependencies = Some(report);
    }

    config.remote.url = match &args.url {
        Some(url) => url.clone(),
        None => prompter.ask("Remote URL", &config.remote.url)?,
    };
    if !config.remote.is_configured() {
        return Err(CliError::User(
            "a remote URL is required (pass --url or answer the prompt)".to_string(),
        ));
    }
    config.remote.username = match &args.username {
        Some(username) => username.clone(),
        None => prompter.ask("Username", &config.remote.username)?,
    };
    let password_label = if config.remote.password.is_empty() {
        "Password"
    } else {
        "Password (blank keeps the saved one)"
    };
    if let Some(password) = prompter.secret(password_label)? {
        config.remote.password = password;
    }
    config.paths.local_dir = match &args.local_dir {
        Some(dir) => dir.clone(),
        None => PathBuf::from(prompter.ask(
            "Local directory",
            &config.paths.local_dir.to_string_lossy(),
        )?),
    };

    config.validate()?;
    config.save(&path)?;
    restrict_permissions(&path);
    std::fs::create_dir_all(&config.paths.local_dir)
        .map_err(|e| SspError::io(&config.paths.local_dir, e))?;
    let ledger = ExclusionLedger::new(&config.paths.ledger_file);
    let ledger_created = ledger.ensure_exists()?;

    let want_schedule = if args.no_schedule {
        false
    } else {
        args.schedule || prompter.confirm("Install the weekly sync schedule?", false)?
    };
    let schedule = if want_schedule {
        let installer = select_installer(HostOs::detect())?;
        Some(install_schedule(cli, &config, installer.as_ref()))
    } else {
        None
    };

    let schedule_ok = schedule.as_ref().is_none_or(|s| s.success);
    match mode {
        OutputMode::Human => {
            println!("{} configuration saved to {}", "[OK]".green().bold(), path.display());
            if ledger_created {
                println!("{} created ledger {}", "[OK]".green().bold(), ledger.path().display());
            }
            if let Some(result) = &schedule {
                if result.success {
                    println!(
                        "{} weekly sync installed ({}: {})",
                        "[OK]".green().bold(),
                        result.backend,
                        result.location
                    );
                } else {
                    println!(
                        "{} schedule install failed: {}",
                        "[ERROR]".red().bold(),
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            println!("Run `ssp sync` to start mirroring.");
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "setup",
            "success": schedule_ok,
            "config_path": path.to_string_lossy(),
            "local_dir": config.paths.local_dir.to_string_lossy(),
            "ledger": ledger.path().to_string_lossy(),
            "ledger_created": ledger_created,
            "dependencies": dependencies.as_ref().map(serde_json::to_value).transpose()?,
            "schedule": schedule.as_ref().map(serde_json::to_value).transpose()?,
        }))?,
    }

    if schedule_ok {
        Ok(())
    } else {
        Err(CliError::Partial(
            "configuration saved but the schedule could not be installed".to_string(),
        ))
    }
}

/// The config holds the remote password; keep it owner-readable only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        eprintln!("[SSP-1001] could not restrict permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{secs}.{:01}s", duration.subsec_millis() / 100)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn emit_version(cli: &Cli) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("ssp {version}");
            if cli.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
                println!("host: {}", HostOs::detect());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "ssp",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                },
                "host": HostOs::detect().as_str(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SSP_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
