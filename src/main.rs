use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;

use mailvault::capabilities::{probe, Capabilities};
use mailvault::config::{DatabaseConfig, ServiceConfig};
use mailvault::db;
use mailvault::transform::progress::{log_progress, ProgressBarReporter};
use mailvault::transform::{
    ProgressFn, TransformOptions, TransformPipeline, TransformProgress,
};

#[derive(Parser, Debug)]
#[command(
    name = "mailvault",
    about = "Privacy classification, redaction and embeddings for an ingested mailbox",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the remote model services and write the capabilities snapshot.
    Capabilities {
        /// Where to write the JSON (defaults to CAPABILITIES_PATH).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Classify, redact and embed eligible emails.
    Transform {
        /// Restrict to one account.
        #[arg(long)]
        account_id: Option<i32>,
        /// Transform a single email, even if already completed.
        #[arg(long)]
        email_id: Option<i64>,
        /// Re-run emails that already completed.
        #[arg(long)]
        force: bool,
        /// Emails per transform batch.
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Stop after this many emails.
        #[arg(long)]
        limit: Option<i64>,
        /// Log progress lines instead of drawing a progress bar.
        #[arg(long)]
        plain: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            log::error!("{message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = ServiceConfig::from_env();

    match cli.command {
        Command::Capabilities { output } => {
            let path = output.unwrap_or_else(|| config.capabilities_path.clone());
            let caps = probe::probe_all(&config).await;
            caps.write(&path).map_err(|err| err.to_string())?;
            log::info!("wrote {}", path.display());
            Ok(())
        }
        Command::Transform {
            account_id,
            email_id,
            force,
            batch_size,
            limit,
            plain,
        } => {
            let caps = Capabilities::load(&config.capabilities_path)
                .and_then(|caps| caps.require_for_transform())
                .map_err(|err| err.to_string())?;
            log::info!(
                "loaded capabilities from {}",
                config.capabilities_path.display()
            );

            let database = DatabaseConfig::from_env()
                .ok_or_else(|| "DATABASE_URL is not set".to_string())?;
            let pool = db::connect(&database)
                .await
                .map_err(|err| format!("database connection failed: {err}"))?;
            db::run_migrations(&pool)
                .await
                .map_err(|err| format!("database migrations failed: {err}"))?;

            let pipeline =
                TransformPipeline::new(pool, caps, &config).map_err(|err| err.to_string())?;
            let opts = TransformOptions {
                account_id,
                email_id,
                force,
                batch_size,
                limit,
            };

            let result = if plain {
                let callback: &ProgressFn = &log_progress;
                pipeline.run(&opts, Some(callback)).await
            } else {
                let reporter = ProgressBarReporter::new();
                let reporter_for_callback = reporter.clone();
                let update = move |event: &TransformProgress| reporter_for_callback.update(event);
                let callback: &ProgressFn = &update;
                let result = pipeline.run(&opts, Some(callback)).await;
                reporter.finish();
                result
            };
            let transformed = result.map_err(|err| err.to_string())?;

            log::info!("transformed {transformed} emails");
            Ok(())
        }
    }
}
