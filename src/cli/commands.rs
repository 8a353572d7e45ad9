//! CLI command definitions for bugforge.
//!
//! Commands are grouped by resource: `env` manages task environments,
//! `episode` runs and inspects self-play episodes, `metrics` aggregates
//! stored outcomes.

use crate::agents::{LlmInjector, LlmSolver};
use crate::config::Settings;
use crate::episode::{Episode, EpisodeEvent, EpisodeStatus};
use crate::llm::LiteLlmClient;
use crate::metrics::MetricsReport;
use crate::model::{Environment, InjectionStrategy, LanguageHint};
use crate::orchestrator::{CancelToken, EpisodeOrchestrator};
use crate::sandbox::{DockerFactory, ResourceLimits};
use crate::storage::Database;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Self-play bug injection and repair episode runner.
#[derive(Parser)]
#[command(name = "bugforge")]
#[command(about = "Run validated bug-injection/repair training episodes")]
#[command(version)]
#[command(
    long_about = "bugforge drives self-play SWE training episodes: an injector model plants a \
bug with an oracle test into a sandboxed codebase, a seven-step validator checks the bug is \
real, observable and fairly scoped, then a solver model gets a bounded number of blind repair \
attempts. Episodes and their binary rewards are persisted in SQLite.\n\nExample usage:\n  \
bugforge env create --name demo --image bugforge-demo:latest --language python --test-command 'pytest -q'\n  \
bugforge episode run --env demo --strategy removal_only"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Manage task environments (sandboxed codebases with a test suite).
    Env(EnvArgs),

    /// Run, resume and inspect episodes.
    #[command(alias = "ep")]
    Episode(EpisodeArgs),

    /// Aggregate reward and funnel metrics over stored episodes.
    Metrics(MetricsArgs),
}

/// Environment management entrypoint arguments.
#[derive(Parser, Debug)]
pub struct EnvArgs {
    /// Environment subcommand to run.
    #[command(subcommand)]
    pub command: EnvSubcommand,
}

/// Environment subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum EnvSubcommand {
    /// Register a new environment.
    Create(EnvCreateArgs),

    /// Register an environment from a YAML definition file.
    Import(EnvImportArgs),

    /// List registered environments.
    List(EnvListArgs),

    /// Show one environment by name or id.
    Show(EnvShowArgs),

    /// Delete an environment with no stored episodes.
    Delete(EnvDeleteArgs),
}

/// Arguments for `bugforge env create`.
#[derive(Parser, Debug)]
pub struct EnvCreateArgs {
    /// Unique environment name.
    #[arg(short = 'n', long)]
    pub name: String,

    /// Docker image reference carrying the codebase.
    #[arg(short = 'i', long)]
    pub image: String,

    /// Primary language of the codebase (python, javascript, rust, go, unknown).
    #[arg(short = 'l', long, default_value = "unknown")]
    pub language: String,

    /// Command that runs the full test suite inside the sandbox.
    #[arg(short = 't', long)]
    pub test_command: String,

    /// Syntax-check command template with a `{file}` placeholder.
    /// Defaults to the language's standard checker when omitted.
    #[arg(long)]
    pub syntax_check: Option<String>,

    /// Free-form notes about the environment.
    #[arg(long)]
    pub notes: Option<String>,

    /// Output the created environment as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge env import`.
#[derive(Parser, Debug)]
pub struct EnvImportArgs {
    /// Path to a YAML file with name, image, language, test_command and
    /// optional syntax_check / notes fields.
    pub file: String,

    /// Output the created environment as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge env list`.
#[derive(Parser, Debug)]
pub struct EnvListArgs {
    /// Output the environment list as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge env show`.
#[derive(Parser, Debug)]
pub struct EnvShowArgs {
    /// Environment name or id.
    pub env: String,

    /// Output the environment as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge env delete`.
#[derive(Parser, Debug)]
pub struct EnvDeleteArgs {
    /// Environment name or id.
    pub env: String,
}

/// Episode entrypoint arguments.
#[derive(Parser, Debug)]
pub struct EpisodeArgs {
    /// Episode subcommand to run.
    #[command(subcommand)]
    pub command: EpisodeSubcommand,
}

/// Episode subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum EpisodeSubcommand {
    /// Run a fresh episode against an environment.
    Run(EpisodeRunArgs),

    /// Resume a non-terminal episode from its persisted state.
    Resume(EpisodeResumeArgs),

    /// Mark a non-terminal episode as cancelled.
    Cancel(EpisodeCancelArgs),

    /// Show one episode by id.
    Show(EpisodeShowArgs),

    /// List stored episodes, newest first.
    List(EpisodeListArgs),
}

/// Arguments for `bugforge episode run`.
#[derive(Parser, Debug)]
pub struct EpisodeRunArgs {
    /// Environment name or id to run against.
    #[arg(short = 'e', long)]
    pub env: String,

    /// Injection strategy (direct, removal_only, history_aware).
    #[arg(short = 's', long, default_value = "removal_only")]
    pub strategy: String,

    /// Seed for the injector prompt and the inverse-mutation checks.
    /// Random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the maximum number of solver attempts.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Output the finished episode as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge episode resume`.
#[derive(Parser, Debug)]
pub struct EpisodeResumeArgs {
    /// Episode id to resume.
    pub id: String,

    /// Output the finished episode as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge episode cancel`.
#[derive(Parser, Debug)]
pub struct EpisodeCancelArgs {
    /// Episode id to cancel.
    pub id: String,
}

/// Arguments for `bugforge episode show`.
#[derive(Parser, Debug)]
pub struct EpisodeShowArgs {
    /// Episode id.
    pub id: String,

    /// Output the episode as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge episode list`.
#[derive(Parser, Debug)]
pub struct EpisodeListArgs {
    /// Only show episodes with this status
    /// (pending, injecting, validating, solving, completed, failed, cancelled).
    #[arg(short = 's', long)]
    pub status: Option<String>,

    /// Maximum number of rows.
    #[arg(long, default_value = "20")]
    pub limit: i64,

    /// Number of rows to skip.
    #[arg(long, default_value = "0")]
    pub offset: i64,

    /// Output the episode list as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bugforge metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Output the metrics report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the bugforge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Env(args) => run_env_command(args).await?,
        Commands::Episode(args) => run_episode_command(args).await?,
        Commands::Metrics(args) => run_metrics_command(args).await?,
    }
    Ok(())
}

// ============================================================================
// Environment commands
// ============================================================================

async fn run_env_command(args: EnvArgs) -> anyhow::Result<()> {
    match args.command {
        EnvSubcommand::Create(args) => run_env_create_command(args).await,
        EnvSubcommand::Import(args) => run_env_import_command(args).await,
        EnvSubcommand::List(args) => run_env_list_command(args).await,
        EnvSubcommand::Show(args) => run_env_show_command(args).await,
        EnvSubcommand::Delete(args) => run_env_delete_command(args).await,
    }
}

async fn run_env_create_command(args: EnvCreateArgs) -> anyhow::Result<()> {
    let language = LanguageHint::parse(&args.language).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown language '{}'. Expected one of: python, javascript, rust, go, unknown.",
            args.language
        )
    })?;

    let mut env = Environment::new(args.name, args.image, language, args.test_command);
    if let Some(syntax_check) = args.syntax_check {
        env = env.with_syntax_check(syntax_check);
    }
    env.notes = args.notes;

    let db = open_database().await?;
    db.insert_environment(&env).await?;
    info!(env_id = %env.env_id, name = %env.name, "Registered environment");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&env)?);
    } else {
        print_environment(&env);
    }
    Ok(())
}

/// On-disk shape of an environment definition file.
#[derive(Debug, serde::Deserialize)]
struct EnvironmentSpec {
    name: String,
    image: String,
    #[serde(default)]
    language: Option<String>,
    test_command: String,
    #[serde(default)]
    syntax_check: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

async fn run_env_import_command(args: EnvImportArgs) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.file, e))?;
    let spec: EnvironmentSpec = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse environment YAML {}: {}", args.file, e))?;

    let language = match spec.language.as_deref() {
        Some(raw) => LanguageHint::parse(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown language '{}' in {}. Expected one of: python, javascript, rust, go, unknown.",
                raw,
                args.file
            )
        })?,
        None => LanguageHint::Unknown,
    };

    let mut env = Environment::new(spec.name, spec.image, language, spec.test_command);
    if let Some(syntax_check) = spec.syntax_check {
        env = env.with_syntax_check(syntax_check);
    }
    env.notes = spec.notes;

    let db = open_database().await?;
    db.insert_environment(&env).await?;
    info!(env_id = %env.env_id, name = %env.name, file = %args.file, "Imported environment");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&env)?);
    } else {
        print_environment(&env);
    }
    Ok(())
}

async fn run_env_list_command(args: EnvListArgs) -> anyhow::Result<()> {
    let db = open_database().await?;
    let envs = db.list_environments().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&envs)?);
        return Ok(());
    }

    if envs.is_empty() {
        println!("No environments registered.");
        return Ok(());
    }
    for env in &envs {
        println!(
            "  {}  {}  [{}]  {}",
            env.env_id, env.name, env.language, env.image_ref
        );
    }
    Ok(())
}

async fn run_env_show_command(args: EnvShowArgs) -> anyhow::Result<()> {
    let db = open_database().await?;
    let env = resolve_environment(&db, &args.env).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&env)?);
    } else {
        print_environment(&env);
    }
    Ok(())
}

async fn run_env_delete_command(args: EnvDeleteArgs) -> anyhow::Result<()> {
    let db = open_database().await?;
    let env = resolve_environment(&db, &args.env).await?;
    db.delete_environment(env.env_id).await?;
    println!("Deleted environment {} ({})", env.name, env.env_id);
    Ok(())
}

fn print_environment(env: &Environment) {
    println!("Environment {}", env.env_id);
    println!("  Name:         {}", env.name);
    println!("  Image:        {}", env.image_ref);
    println!("  Language:     {}", env.language);
    println!("  Test command: {}", env.test_command);
    if let Some(check) = &env.syntax_check_command {
        println!("  Syntax check: {}", check);
    }
    if let Some(notes) = &env.notes {
        println!("  Notes:        {}", notes);
    }
    println!("  Created:      {}", env.created_at);
}

// ============================================================================
// Episode commands
// ============================================================================

async fn run_episode_command(args: EpisodeArgs) -> anyhow::Result<()> {
    match args.command {
        EpisodeSubcommand::Run(args) => run_episode_run_command(args).await,
        EpisodeSubcommand::Resume(args) => run_episode_resume_command(args).await,
        EpisodeSubcommand::Cancel(args) => run_episode_cancel_command(args).await,
        EpisodeSubcommand::Show(args) => run_episode_show_command(args).await,
        EpisodeSubcommand::List(args) => run_episode_list_command(args).await,
    }
}

async fn run_episode_run_command(args: EpisodeRunArgs) -> anyhow::Result<()> {
    let strategy = InjectionStrategy::parse(&args.strategy).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown strategy '{}'. Expected one of: direct, removal_only, history_aware.",
            args.strategy
        )
    })?;
    let seed = args.seed.unwrap_or_else(rand::random);

    let mut settings = Settings::from_env();
    if let Some(max_attempts) = args.max_attempts {
        settings = settings.with_max_solver_attempts(max_attempts);
    }

    let db = open_database().await?;
    let env = resolve_environment(&db, &args.env).await?;
    let orchestrator = build_orchestrator(settings, db)?;

    let cancel = CancelToken::new();
    spawn_cancel_on_ctrl_c(&cancel);

    info!(env = %env.name, %strategy, seed, "Starting episode");
    let episode = orchestrator
        .run_episode(env.env_id, strategy, seed, &cancel)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&episode)?);
    } else {
        print_episode(&episode);
    }
    Ok(())
}

async fn run_episode_resume_command(args: EpisodeResumeArgs) -> anyhow::Result<()> {
    let episode_id = parse_episode_id(&args.id)?;

    let db = open_database().await?;
    let orchestrator = build_orchestrator(Settings::from_env(), db)?;

    let cancel = CancelToken::new();
    spawn_cancel_on_ctrl_c(&cancel);

    info!(%episode_id, "Resuming episode");
    let episode = orchestrator.resume(episode_id, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&episode)?);
    } else {
        print_episode(&episode);
    }
    Ok(())
}

async fn run_episode_cancel_command(args: EpisodeCancelArgs) -> anyhow::Result<()> {
    let episode_id = parse_episode_id(&args.id)?;

    let db = open_database().await?;
    let mut episode = db
        .get_episode(episode_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Episode not found: {}", episode_id))?;
    episode.advance(EpisodeEvent::CancelRequested)?;
    db.save_episode(&episode).await?;

    println!("Cancelled episode {}", episode.episode_id);
    Ok(())
}

async fn run_episode_show_command(args: EpisodeShowArgs) -> anyhow::Result<()> {
    let episode_id = parse_episode_id(&args.id)?;

    let db = open_database().await?;
    let episode = db
        .get_episode(episode_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Episode not found: {}", episode_id))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&episode)?);
    } else {
        print_episode(&episode);
    }
    Ok(())
}

/// Row shape for `episode list --json`.
#[derive(Debug, Clone, Serialize)]
struct EpisodeRow {
    episode_id: Uuid,
    env_id: Uuid,
    status: EpisodeStatus,
    phase: String,
    attempts: usize,
    final_reward: Option<f64>,
    created_at: String,
}

async fn run_episode_list_command(args: EpisodeListArgs) -> anyhow::Result<()> {
    let status = match args.status.as_deref() {
        Some(raw) => Some(EpisodeStatus::parse(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown status '{}'. Expected one of: pending, injecting, validating, \
                 solving, completed, failed, cancelled.",
                raw
            )
        })?),
        None => None,
    };

    let db = open_database().await?;
    let episodes = db.list_episodes(status, args.limit, args.offset).await?;

    if args.json {
        let rows: Vec<EpisodeRow> = episodes
            .iter()
            .map(|e| EpisodeRow {
                episode_id: e.episode_id,
                env_id: e.env_id,
                status: e.status,
                phase: e.phase.clone(),
                attempts: e.attempts.len(),
                final_reward: e.final_reward,
                created_at: e.created_at.to_rfc3339(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if episodes.is_empty() {
        println!("No episodes found.");
        return Ok(());
    }
    for e in &episodes {
        let reward = e
            .final_reward
            .map(|r| format!("{:.1}", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  [{}]  attempts={}  reward={}  {}",
            e.episode_id,
            e.status,
            e.attempts.len(),
            reward,
            e.created_at
        );
    }
    Ok(())
}

fn print_episode(episode: &Episode) {
    println!("Episode {}", episode.episode_id);
    println!("  Environment: {}", episode.env_id);
    println!("  Status:      {}", episode.status);
    println!("  Phase:       {}", episode.phase);
    println!("  Strategy:    {}", episode.strategy);
    println!("  Seed:        {}", episode.seed);

    if let Some(report) = &episode.validation_report {
        let passed = report.steps.iter().filter(|s| s.passed).count();
        println!(
            "  Validation:  {} ({}/{} steps passed)",
            if report.passed { "passed" } else { "rejected" },
            passed,
            report.steps.len()
        );
        if let Some(failure) = report.first_failure() {
            println!(
                "    step {} ({}): {}",
                failure.step, failure.name, failure.message
            );
        }
    }

    if !episode.attempts.is_empty() {
        println!(
            "  Attempts:    {}/{}",
            episode.attempts.len(),
            episode.max_attempts
        );
        for attempt in &episode.attempts {
            println!(
                "    #{} {} ({}/{} gates)",
                attempt.index,
                if attempt.solved { "solved" } else { "failed" },
                attempt.tests_passed,
                attempt.tests_total
            );
        }
    }

    match episode.final_reward {
        Some(reward) => println!("  Reward:      {:.1}", reward),
        None => println!("  Reward:      -"),
    }
    if let Some(error) = &episode.error {
        println!("  Error:       {}", error);
    }
}

// ============================================================================
// Metrics command
// ============================================================================

async fn run_metrics_command(args: MetricsArgs) -> anyhow::Result<()> {
    let db = open_database().await?;
    let report = MetricsReport::collect(&db).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Episodes: {}", report.total_episodes);
    for (status, count) in &report.by_status {
        println!("  {}: {}", status, count);
    }
    println!("Validation pass rate: {:.2}", report.validation_pass_rate);
    println!("Solve rate:           {:.2}", report.solve_rate);
    println!("Mean reward:          {:.2}", report.mean_reward);
    println!("Mean attempts:        {:.2}", report.mean_attempts);
    if !report.step_rates.is_empty() {
        println!("Validator funnel:");
        for rate in &report.step_rates {
            println!(
                "  step {} {}: {}/{} ({:.2})",
                rate.step,
                rate.name,
                rate.passes,
                rate.runs,
                rate.rate()
            );
        }
    }
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

async fn open_database() -> anyhow::Result<Database> {
    let settings = Settings::from_env();
    Database::connect(&settings.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", settings.database_url, e))
}

async fn resolve_environment(db: &Database, reference: &str) -> anyhow::Result<Environment> {
    if let Ok(env_id) = Uuid::parse_str(reference) {
        if let Some(env) = db.get_environment(env_id).await? {
            return Ok(env);
        }
    }
    db.get_environment_by_name(reference)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown environment: {}", reference))
}

fn parse_episode_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| anyhow::anyhow!("Invalid episode id: {}", raw))
}

fn build_orchestrator(settings: Settings, db: Database) -> anyhow::Result<EpisodeOrchestrator> {
    let llm = Arc::new(LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Set the BUGFORGE_API_BASE env var \
             (and BUGFORGE_API_KEY if the endpoint requires one).",
            e
        )
    })?);
    let model = llm.default_model().to_string();

    let injector = Arc::new(LlmInjector::new(llm.clone(), model.clone()));
    let solver = Arc::new(
        LlmSolver::new(llm, model.clone())
            .with_sampling(settings.solver.temperature, settings.solver.max_tokens),
    );
    let factory = Arc::new(DockerFactory::new(ResourceLimits::default()));

    Ok(EpisodeOrchestrator::new(settings, db, factory, injector, solver).with_model_id(model))
}

/// Flip the cancel token on Ctrl-C so the current episode stops cleanly
/// between steps instead of being killed mid-write.
fn spawn_cancel_on_ctrl_c(cancel: &CancelToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested; the episode will stop at the next checkpoint");
            cancel.cancel();
        }
    });
}
