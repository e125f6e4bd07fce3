use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use goldrec_clients::{HttpMatchingService, PgWarehouse};
use goldrec_core::PipelineContext;
use goldrec_pipeline::{
    Notifier, Orchestrator, Settings, SettingsSources, TracingNotifier, WebhookNotifier,
};
use goldrec_storage::FsObjectStore;

#[derive(Debug, Parser)]
#[command(name = "goldrec-cli")]
#[command(about = "Golden record pipeline: extract, match, and load entity data")]
struct Cli {
    /// Path to the YAML config file (default: the GOLDREC_CONFIG variable).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Path to a credentials-only secrets file (default: GOLDREC_SECRETS_FILE).
    #[arg(long, global = true)]
    secrets_file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full extract -> match -> load pipeline for one batch.
    Run {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        process_date: NaiveDate,
    },
    /// Resume a persisted run at its first incomplete stage.
    Resume { run_id: Uuid },
    /// Show the persisted state of a run, including per-stage status.
    Status { run_id: Uuid },
    /// Extract stage commands.
    #[command(subcommand)]
    Extract(ExtractCommands),
    /// Matching stage commands.
    #[command(subcommand)]
    Process(ProcessCommands),
    /// Load stage commands.
    #[command(subcommand)]
    Load(LoadCommands),
}

#[derive(Debug, Subcommand)]
enum ExtractCommands {
    /// Extract source records for one batch into the object store.
    Run {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        process_date: NaiveDate,
    },
}

#[derive(Debug, Subcommand)]
enum ProcessCommands {
    /// Submit a matching job and poll it to completion.
    Run {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        process_date: NaiveDate,
        /// Explicit input object; defaults to the newest extract output.
        #[arg(long)]
        input_uri: Option<String>,
        /// Return right after submission instead of polling.
        #[arg(long)]
        no_wait: bool,
    },
    /// Print one status snapshot for a matching job.
    Status { job_id: String },
    /// Cancel a submitted matching job before abandoning its run.
    Cancel { job_id: String },
}

#[derive(Debug, Subcommand)]
enum LoadCommands {
    /// Load matched records into the domain's target table.
    Run {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        process_date: NaiveDate,
        /// Explicit matched-records object; defaults to the newest output.
        #[arg(long)]
        input_uri: Option<String>,
    },
    /// Create the domain's target table if it does not exist.
    Setup {
        #[arg(long)]
        domain: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let store = Arc::new(FsObjectStore::new(settings.object_store.root.clone()));
    let source = Arc::new(
        PgWarehouse::connect_lazy(&settings.warehouse.source.url)
            .context("configuring source warehouse")?,
    );
    let target = Arc::new(
        PgWarehouse::connect_lazy(&settings.warehouse.target.url)
            .context("configuring target warehouse")?,
    );
    let matching = Arc::new(
        HttpMatchingService::new(settings.matching.client_config())
            .context("configuring matching service client")?,
    );
    let notifier: Arc<dyn Notifier> = match &settings.notify.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone()).context("configuring webhook notifier")?,
        ),
        None => Arc::new(TracingNotifier),
    };
    Ok(Orchestrator::new(
        settings.clone(),
        store,
        source,
        target,
        matching,
        notifier,
    ))
}

fn finish(ctx: &PipelineContext) -> ExitCode {
    match &ctx.failure {
        Some(failure) => {
            eprintln!(
                "run {} failed at the {} stage: {}",
                ctx.run_id, failure.stage, failure.message
            );
            ExitCode::FAILURE
        }
        None => {
            println!(
                "run {} {}: domain={} records_in={} records_matched={} job_id={}",
                ctx.run_id,
                if ctx.is_complete() {
                    "complete"
                } else {
                    "in progress"
                },
                ctx.domain,
                ctx.record_count_in,
                ctx.record_count_matched,
                ctx.job_id.as_deref().unwrap_or("-"),
            );
            ExitCode::SUCCESS
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(&SettingsSources {
        config_file: cli.config.clone(),
        secrets_file: cli.secrets_file.clone(),
    })?;
    debug!(config = ?cli.config, domains = settings.domains.len(), "settings loaded");
    let orchestrator = build_orchestrator(&settings)?;

    let ctx = match cli.command {
        Commands::Run {
            domain,
            process_date,
        } => orchestrator.run(&domain, process_date).await?,
        Commands::Resume { run_id } => orchestrator.resume(run_id).await?,
        Commands::Status { run_id } => {
            let ctx = orchestrator.load_context(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Extract(ExtractCommands::Run {
            domain,
            process_date,
        }) => orchestrator.run_extract(&domain, process_date).await?,
        Commands::Process(ProcessCommands::Run {
            domain,
            process_date,
            input_uri,
            no_wait,
        }) => {
            orchestrator
                .run_process(&domain, process_date, input_uri, !no_wait)
                .await?
        }
        Commands::Process(ProcessCommands::Status { job_id }) => {
            let report = orchestrator.job_status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Process(ProcessCommands::Cancel { job_id }) => {
            orchestrator.cancel_job(&job_id).await?;
            println!("cancellation requested for job {job_id}");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Load(LoadCommands::Run {
            domain,
            process_date,
            input_uri,
        }) => orchestrator.run_load(&domain, process_date, input_uri).await?,
        Commands::Load(LoadCommands::Setup { domain }) => {
            orchestrator.setup(&domain).await?;
            println!("target table ready for domain {domain}");
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(finish(&ctx))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
