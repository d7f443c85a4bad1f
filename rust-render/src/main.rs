mod cli;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Args, Commands};
use rust_render::config::AppConfig;
use rust_render::database;
use rust_render::logging;
use rust_render::pipeline::RenderService;
use rust_render::project::ProjectSpec;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let log_dir = if matches!(args.command, Commands::Serve) {
        config.log_dir.clone()
    } else {
        None
    };
    let (logging_config, _guard) = logging::init_logging(log_dir.as_deref())?;
    if let Some(filter) = &args.log_filter {
        logging_config.set_filter(filter)?;
    }

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let service = RenderService::from_config(&config, pool);

    match args.command {
        Commands::Serve => {
            let cancel = CancellationToken::new();
            info!(filter = %logging_config.get_filter(), "Logging initialized");
            logging_config.start_retention_cleanup(cancel.clone());
            serve(&service, &config).await?;
            cancel.cancel();
        }
        Commands::Enqueue {
            project,
            name,
            priority,
        } => {
            let raw = tokio::fs::read_to_string(&project)
                .await
                .with_context(|| format!("reading {}", project.display()))?;
            let spec: ProjectSpec =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", project.display()))?;
            spec.validate()?;

            let name = name.unwrap_or_else(|| {
                project
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "render".to_string())
            });
            let job_id = service.enqueue_with_priority(&name, &spec, priority).await?;
            println!("{}", job_id);
        }
        Commands::Status { job } => {
            service.load_status().await?;
            let output = match job {
                Some(id) => {
                    let snapshot = service
                        .job_status(&id)
                        .ok_or_else(|| rust_render::Error::not_found("Job", &id))?;
                    serde_json::to_string_pretty(&snapshot)?
                }
                None => serde_json::to_string_pretty(&serde_json::json!({
                    "stats": service.stats().await?,
                    "jobs": service.status(),
                }))?,
            };
            println!("{}", output);
        }
        Commands::Drain { wait } => {
            let report = service.drain(wait).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Resume => {
            service.resume().await?;
            println!("queue resumed");
        }
        Commands::Cancel { job } => {
            service.cancel_job(&job).await?;
            println!("cancelled {}", job);
        }
    }

    Ok(())
}

async fn serve(service: &RenderService, config: &AppConfig) -> anyhow::Result<()> {
    if !process_utils::is_program_available(&config.export.ffmpeg_path, "-version") {
        error!(
            ffmpeg = %config.export.ffmpeg_path,
            "Encoder binary not found; jobs will fail until it is installed"
        );
    }

    service.start().await?;
    info!(
        workers = config.workers.max_workers,
        workspace_root = %config.workspace_root.display(),
        artifact_dir = %config.artifact_dir.display(),
        "rust-render serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;

    info!("Shutdown signal received");
    service.shutdown().await;
    Ok(())
}
