use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use classpix_core::backend;
use classpix_pipeline::config::ForceToggles;
use classpix_pipeline::{Pipeline, PipelineError, Settings};

#[derive(Parser)]
#[command(
    name = "classpix",
    version,
    about = "Organize group photos by the people in them"
)]
struct Cli {
    /// Working directory holding input/, output/, logs/, and config.toml
    #[arg(short = 'w', long, default_value = ".")]
    working_dir: PathBuf,

    /// Config file path (defaults to <working-dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force serial recognition (wins over --parallel)
    #[arg(long)]
    serial: bool,

    /// Force parallel recognition even below the photo-count threshold
    #[arg(long)]
    parallel: bool,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            // Fatal conditions get one line of what went wrong, one hint,
            // and the exit code contract.
            if let Some(pipeline_err) = e.downcast_ref::<PipelineError>() {
                eprintln!("classpix: {pipeline_err}");
                eprintln!("hint: {}", pipeline_err.hint());
                eprintln!("(details are in the log file under the logs/ folder)");
                std::process::exit(pipeline_err.exit_code());
            }
            eprintln!("classpix: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let working_dir = cli
        .working_dir
        .canonicalize()
        .with_context(|| format!("working directory not found: {}", cli.working_dir.display()))?;

    let config_path = cli
        .config
        .unwrap_or_else(|| working_dir.join("config.toml"));
    let settings = Settings::load(&config_path)?.anchored_at(&working_dir);

    let log_path = init_logging(&settings)?;
    tracing::info!(
        working_dir = %working_dir.display(),
        config = %config_path.display(),
        engine = %settings.backend.engine,
        "classpix starting"
    );

    let mut toggles = ForceToggles::from_env();
    toggles.force_serial |= cli.serial;
    toggles.force_parallel |= cli.parallel;

    let backend = backend::create_backend(settings.backend.engine, &settings.backend.model_dir)
        .map_err(PipelineError::Backend)?;

    // Ctrl-C flips the cancellation flag; the pipeline drains in-flight
    // work, persists what it has, and exits cleanly.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::SeqCst) {
                // Second Ctrl-C: the user really means it.
                std::process::exit(130);
            }
            eprintln!("\nclasspix: finishing in-flight photos, then stopping...");
        })
        .context("could not install Ctrl-C handler")?;
    }

    let pipeline = Pipeline::new(settings, Arc::from(backend), toggles);
    let summary = pipeline.run(cancel)?;

    println!(
        "Done: {} photos ({} recognized, {} without faces, {} errors, {} from cache)",
        summary.total_photos,
        summary.success_photos,
        summary.no_face_photos,
        summary.error_photos,
        summary.cache_hits,
    );
    if summary.cancelled {
        println!("Run was cancelled; results are partial.");
    }
    if summary.fell_back_to_serial {
        println!("Note: worker pool was unavailable, photos were processed serially.");
    }
    if let Some(report) = &summary.report_path {
        println!("Report: {}", report.display());
    }
    if let Some(log) = &log_path {
        println!("Log:    {}", log.display());
    }
    Ok(())
}

/// Console logging (ANSI, env-filtered) plus a plain timestamped log
/// file under the log root.
fn init_logging(settings: &Settings) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(&settings.log_root).ok();
    let log_path = settings.log_root.join(format!(
        "classpix_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));

    match std::fs::File::create(&log_path) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
            Ok(Some(log_path))
        }
        Err(_) => {
            // No log file (e.g. read-only log root): console only.
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}
