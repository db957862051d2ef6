//! Command surface for the outreach event log and its metrics.
//!
//! Hosts can embed this crate through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a parsed [`Command`] against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteEventStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use outreach_metrics_core::{
    format_rfc3339, generate_seed_events, load_dashboard, now_utc, parse_rfc3339,
    validate_workspace, CampaignDetail, CampaignId, DeclarativeMetrics, EventQuery, EventStore, KpiSnapshot,
    LeadId, MetricsConfig, MetricsEngine, OutreachEvent, OutreachEventInput, OutreachEventType,
    PausedCampaign, SeedPlan, SystemContext, ValidationReport, WorkspaceId,
};
use outreach_metrics_store_sqlite::{SqliteEventStore, WorkspaceSummary};
use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

pub const KPI_CONTRACT_VERSION: &str = "kpi_snapshot.v1";

#[derive(Debug, Parser)]
#[command(name = "outreach")]
#[command(about = "OutreachOS event log and metrics CLI")]
pub struct Cli {
    #[arg(long, default_value = "./outreach_events.sqlite3")]
    db: PathBuf,

    /// JSON metrics configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tracing filter directive written to stderr, e.g. `info` or `outreach_metrics_core=debug`.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Metrics {
        #[command(subcommand)]
        command: Box<MetricsCommand>,
    },
    Dashboard {
        #[command(subcommand)]
        command: Box<DashboardCommand>,
    },
    /// Appends a deterministic week of test events to a workspace.
    Seed(SeedArgs),
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    Append(AppendArgs),
    /// Appends a JSON array (or JSON lines) of event payloads atomically.
    Import(ImportArgs),
    List(ListArgs),
    Workspaces(JsonFlag),
}

#[derive(Debug, Args)]
pub struct AppendArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    event: EventTypeArg,
    #[arg(long)]
    campaign_id: Option<String>,
    #[arg(long)]
    lead_id: Option<String>,
    /// RFC3339 business timestamp; defaults to the append time.
    #[arg(long)]
    at: Option<String>,
    #[arg(long, default_value = "{}")]
    metadata_json: String,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    event: Option<EventTypeArg>,
    #[arg(long)]
    campaign_id: Option<String>,
    #[arg(long)]
    lead_id: Option<String>,
    #[arg(long)]
    start_time: Option<String>,
    #[arg(long)]
    end_time: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonFlag {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommand {
    /// KPIs recomputed by replaying raw events.
    Replay(KpiArgs),
    /// KPIs from SQL views and aggregates.
    Declarative(KpiArgs),
    /// Cross-checks both arms and exits non-zero on any disagreement.
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct KpiArgs {
    #[arg(long)]
    workspace: String,
    /// RFC3339 instant, read in the configured `utc_offset_minutes`.
    #[arg(long)]
    now: Option<String>,
    #[arg(long)]
    window_days: Option<u16>,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    workspace: String,
    /// Repeatable. Defaults to now, now-3d and now-7d.
    #[arg(long = "now")]
    nows: Vec<String>,
    #[arg(long)]
    window_days: Option<u16>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum DashboardCommand {
    Show(DashboardArgs),
}

#[derive(Debug, Args)]
pub struct DashboardArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long)]
    now: Option<String>,
    #[arg(long, default_value_t = 1)]
    active_campaigns: u32,
    /// Defaults to the configured `default_daily_limit`.
    #[arg(long)]
    daily_limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    lead_count: u64,
    #[arg(long, default_value = "Manual")]
    execution_mode: String,
    #[arg(long)]
    paused_campaign_id: Option<String>,
    #[arg(long, default_value = "")]
    paused_campaign_name: String,
    #[arg(long, default_value_t = 0)]
    paused_enrollments: u64,
    /// JSON array of `{campaignId, name, queueRemaining}` from the campaign controller.
    #[arg(long, default_value = "[]")]
    campaigns_json: String,
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    #[arg(long)]
    workspace: String,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventTypeArg {
    MessageQueued,
    MessageSent,
    MessageFailed,
    ReplyReceived,
    ReplyClassified,
    FollowupScheduled,
    FollowupSent,
    CampaignPaused,
    CampaignResumed,
    AutomationThrottled,
    AutomationResumed,
    CaptchaDetected,
    ManualActionRequired,
}

impl From<EventTypeArg> for OutreachEventType {
    fn from(value: EventTypeArg) -> Self {
        match value {
            EventTypeArg::MessageQueued => Self::MessageQueued,
            EventTypeArg::MessageSent => Self::MessageSent,
            EventTypeArg::MessageFailed => Self::MessageFailed,
            EventTypeArg::ReplyReceived => Self::ReplyReceived,
            EventTypeArg::ReplyClassified => Self::ReplyClassified,
            EventTypeArg::FollowupScheduled => Self::FollowupScheduled,
            EventTypeArg::FollowupSent => Self::FollowupSent,
            EventTypeArg::CampaignPaused => Self::CampaignPaused,
            EventTypeArg::CampaignResumed => Self::CampaignResumed,
            EventTypeArg::AutomationThrottled => Self::AutomationThrottled,
            EventTypeArg::AutomationResumed => Self::AutomationResumed,
            EventTypeArg::CaptchaDetected => Self::CaptchaDetected,
            EventTypeArg::ManualActionRequired => Self::ManualActionRequired,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KpiPayload {
    pub contract_version: String,
    pub workspace_id: String,
    pub arm: String,
    pub now: String,
    pub reply_window_days: u16,
    pub kpis: KpiSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SeedPayload {
    pub workspace_id: String,
    pub seed: u64,
    pub appended: usize,
    pub now: String,
    pub kpis: KpiSnapshot,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or command
/// execution fails, including a metrics validation mismatch.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_with_db(&cli.db, cli.command, &config)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, command: Command, config: &MetricsConfig) -> Result<()> {
    let mut store = SqliteEventStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store, config)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence, or metric computation
/// fails, or when `metrics validate` finds a disagreement.
pub fn run_command(
    command: Command,
    store: &mut SqliteEventStore,
    config: &MetricsConfig,
) -> Result<()> {
    match command {
        Command::Events { command } => run_events(*command, store),
        Command::Metrics { command } => run_metrics(*command, store, config),
        Command::Dashboard { command } => run_dashboard(*command, store, config),
        Command::Seed(args) => {
            let payload = seed_workspace(&args, store, config)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_events(command: EventsCommand, store: &mut SqliteEventStore) -> Result<()> {
    match command {
        EventsCommand::Append(args) => {
            let mut input =
                OutreachEventInput::new(parse_workspace(&args.workspace)?, args.event.into());
            input.campaign_id = parse_campaign(args.campaign_id.as_deref())?;
            input.lead_id = parse_lead(args.lead_id.as_deref())?;
            input.event_timestamp = parse_optional_instant(args.at.as_deref())?;
            input.metadata = parse_metadata_json(&args.metadata_json)?;

            let event = store.append_event(&input)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        EventsCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let inputs = parse_import_payloads(&raw)?;
            let appended = store.append_batch(&inputs)?;
            tracing::info!(appended, file = %args.file.display(), "imported outreach events");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "appended": appended }))?
            );
            Ok(())
        }
        EventsCommand::List(args) => {
            let workspace_id = parse_workspace(&args.workspace)?;
            let filters = EventQuery {
                event_type: args.event.map(Into::into),
                campaign_id: parse_campaign(args.campaign_id.as_deref())?,
                lead_id: parse_lead(args.lead_id.as_deref())?,
                start_time: parse_optional_instant(args.start_time.as_deref())?,
                end_time: parse_optional_instant(args.end_time.as_deref())?,
                limit: args.limit,
            };
            let events = store.query(&workspace_id, &filters)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                print_events_table(&events)?;
            }
            Ok(())
        }
        EventsCommand::Workspaces(args) => {
            let summaries = store.workspaces()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_workspaces_table(&summaries);
            }
            Ok(())
        }
    }
}

fn run_metrics(
    command: MetricsCommand,
    store: &SqliteEventStore,
    config: &MetricsConfig,
) -> Result<()> {
    match command {
        MetricsCommand::Replay(args) => {
            let config = with_window(config, args.window_days)?;
            let workspace_id = parse_workspace(&args.workspace)?;
            let now = resolve_now(args.now.as_deref(), &config)?;
            let kpis = MetricsEngine::new(store, &config).compute(&workspace_id, now)?;
            let payload = build_kpi_payload(&workspace_id, "replay", now, &config, kpis)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        MetricsCommand::Declarative(args) => {
            let config = with_window(config, args.window_days)?;
            let workspace_id = parse_workspace(&args.workspace)?;
            let now = resolve_now(args.now.as_deref(), &config)?;
            let kpis =
                store.declarative_kpis(&workspace_id, now, config.reply_rate_window_days)?;
            let payload = build_kpi_payload(&workspace_id, "declarative", now, &config, kpis)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        MetricsCommand::Validate(args) => {
            let config = with_window(config, args.window_days)?;
            let workspace_id = parse_workspace(&args.workspace)?;
            let nows = resolve_validation_instants(&args.nows, &config)?;
            let report = validate_workspace(store, &workspace_id, &nows, &config)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation_report(&report);
            }

            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!(
                    "metrics validation failed: {} of {} comparisons disagree",
                    report.failed,
                    report.results.len()
                ))
            }
        }
    }
}

fn run_dashboard(
    command: DashboardCommand,
    store: &SqliteEventStore,
    config: &MetricsConfig,
) -> Result<()> {
    match command {
        DashboardCommand::Show(args) => {
            let workspace_id = parse_workspace(&args.workspace)?;
            let now = resolve_now(args.now.as_deref(), config)?;
            let context = build_system_context(&args, config)?;
            let engine = MetricsEngine::new(store, config);
            let stats = load_dashboard(&engine, &workspace_id, now, &context)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn seed_workspace(
    args: &SeedArgs,
    store: &mut SqliteEventStore,
    config: &MetricsConfig,
) -> Result<SeedPayload> {
    let workspace_id = parse_workspace(&args.workspace)?;
    let now = resolve_now(args.now.as_deref(), config)?;
    let plan = SeedPlan::new(workspace_id.clone(), now, args.seed)?;
    let inputs = generate_seed_events(&plan)?;
    let appended = store.append_batch(&inputs)?;
    let kpis = MetricsEngine::new(&*store, config).compute(&workspace_id, now)?;

    Ok(SeedPayload {
        workspace_id: workspace_id.to_string(),
        seed: args.seed,
        appended,
        now: format_rfc3339(now)?,
        kpis,
    })
}

fn build_system_context(args: &DashboardArgs, config: &MetricsConfig) -> Result<SystemContext> {
    let paused_campaign = args
        .paused_campaign_id
        .as_deref()
        .map(|raw| -> Result<PausedCampaign> {
            Ok(PausedCampaign {
                campaign_id: CampaignId::parse(raw)?,
                name: args.paused_campaign_name.clone(),
                active_enrollments: args.paused_enrollments,
            })
        })
        .transpose()?;

    Ok(SystemContext {
        active_campaigns: args.active_campaigns,
        daily_limit: args.daily_limit.unwrap_or(config.default_daily_limit),
        lead_count: args.lead_count,
        execution_mode: args.execution_mode.clone(),
        paused_campaign,
        campaigns: parse_campaigns_json(&args.campaigns_json)?,
    })
}

fn build_kpi_payload(
    workspace_id: &WorkspaceId,
    arm: &str,
    now: OffsetDateTime,
    config: &MetricsConfig,
    kpis: KpiSnapshot,
) -> Result<KpiPayload> {
    Ok(KpiPayload {
        contract_version: KPI_CONTRACT_VERSION.to_string(),
        workspace_id: workspace_id.to_string(),
        arm: arm.to_string(),
        now: format_rfc3339(now)?,
        reply_window_days: config.reply_rate_window_days,
        kpis,
    })
}

/// Loads a JSON configuration file, or the v1 defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<MetricsConfig> {
    let Some(path) = path else {
        return Ok(MetricsConfig::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config at {} must be valid JSON", path.display()))?;
    MetricsConfig::from_json(&value).with_context(|| format!("invalid config at {}", path.display()))
}

fn with_window(config: &MetricsConfig, window_days: Option<u16>) -> Result<MetricsConfig> {
    let mut config = config.clone();
    if let Some(days) = window_days {
        config.reply_rate_window_days = days;
        config.validate()?;
    }
    Ok(config)
}

/// The instant comes from `--now` or the wall clock; local midnight always
/// comes from the configured offset.
fn resolve_now(raw: Option<&str>, config: &MetricsConfig) -> Result<OffsetDateTime> {
    let instant = match raw {
        Some(value) => parse_rfc3339(value).map_err(|err| anyhow!("invalid --now: {err}"))?,
        None => now_utc(),
    };
    Ok(config.local_now(instant)?)
}

fn resolve_validation_instants(
    raw: &[String],
    config: &MetricsConfig,
) -> Result<Vec<OffsetDateTime>> {
    if raw.is_empty() {
        let now = config.local_now(now_utc())?;
        return Ok(vec![now, now - Duration::days(3), now - Duration::days(7)]);
    }
    raw.iter()
        .map(|value| parse_rfc3339(value).map_err(|err| anyhow!("invalid --now: {err}")))
        .collect()
}

fn parse_optional_instant(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_rfc3339(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}

fn parse_workspace(raw: &str) -> Result<WorkspaceId> {
    WorkspaceId::parse(raw).with_context(|| format!("invalid workspace: {raw:?}"))
}

fn parse_campaign(raw: Option<&str>) -> Result<Option<CampaignId>> {
    Ok(raw.map(CampaignId::parse).transpose()?)
}

fn parse_lead(raw: Option<&str>) -> Result<Option<LeadId>> {
    Ok(raw.map(LeadId::parse).transpose()?)
}

fn parse_campaigns_json(raw: &str) -> Result<Vec<CampaignDetail>> {
    serde_json::from_str(raw).with_context(|| {
        format!("campaigns_json must be an array of {{campaignId, name, queueRemaining}}: {raw}")
    })
}

fn parse_metadata_json(raw: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw)
        .with_context(|| format!("metadata_json must be valid JSON: {raw}"))?
    {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("metadata_json must be a JSON object")),
    }
}

/// Accepts either one JSON array of payloads or one payload per line.
fn parse_import_payloads(raw: &str) -> Result<Vec<OutreachEventInput>> {
    let trimmed = raw.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("import file must be a JSON array of events")?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("line {} is not valid JSON", index + 1))
            })
            .collect::<Result<_>>()?
    };

    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            OutreachEventInput::from_payload(value)
                .with_context(|| format!("event {index} rejected"))
        })
        .collect()
}

fn print_events_table(events: &[OutreachEvent]) -> Result<()> {
    println!(
        "{:<30} {:<24} {:<16} {:<16} metadata",
        "event_timestamp", "event_type", "campaign_id", "lead_id"
    );
    println!("{}", "-".repeat(110));
    for event in events {
        println!(
            "{:<30} {:<24} {:<16} {:<16} {}",
            format_rfc3339(event.event_timestamp)?,
            event.event_type.as_str(),
            event.campaign_id.as_ref().map_or("-", CampaignId::as_str),
            event.lead_id.as_ref().map_or("-", LeadId::as_str),
            Value::Object(event.metadata.clone())
        );
    }
    Ok(())
}

fn print_workspaces_table(summaries: &[WorkspaceSummary]) {
    println!(
        "{:<24} {:<8} {:<30} last_event_at",
        "workspace_id", "events", "first_event_at"
    );
    for summary in summaries {
        println!(
            "{:<24} {:<8} {:<30} {}",
            summary.workspace_id, summary.event_count, summary.first_event_at, summary.last_event_at
        );
    }
}

fn print_validation_report(report: &ValidationReport) {
    println!(
        "contract={} workspace={} window_days={}",
        report.contract_version, report.workspace_id, report.reply_window_days
    );
    println!(
        "{:<26} {:<24} {:>8} {:>12} result",
        "now", "metric", "replay", "declarative"
    );
    println!("{}", "-".repeat(90));
    for result in &report.results {
        println!(
            "{:<26} {:<24} {:>8} {:>12} {}",
            result.now,
            result.metric.label(),
            result.replay_value,
            result.declarative_value,
            if result.matched { "PASS" } else { "FAIL" }
        );
        if let Some(divergence) = &result.divergence {
            println!("    divergence: {}", divergence.detail);
        }
    }
    println!(
        "passed={} failed={} healthy={}",
        report.passed,
        report.failed,
        if report.healthy { "yes" } else { "no" }
    );
}
