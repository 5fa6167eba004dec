//! facewatchd - multi-camera face recognition daemon
//!
//! This daemon:
//! 1. Loads the config and the known-face set
//! 2. Starts one capture thread per configured camera
//! 3. Runs recognition over sampled frames in batches
//! 4. On Ctrl-C/SIGTERM (or when every camera has ended) releases the cameras,
//!    stores the results and mails the summary report

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use facewatch::{init_logging, FacewatchConfig, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "facewatchd", about = "Multi-camera face recognition daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "FACEWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Load config and known faces, print what would run, and exit
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = FacewatchConfig::load_from(args.config.as_deref())?;
    init_logging(config.log_file.as_deref())?;

    let pipeline = Pipeline::from_config(config)?;
    if args.dry_run {
        let config = pipeline.config();
        for camera in &config.cameras {
            log::info!(
                "camera {} -> {}",
                camera.name,
                facewatch::ingest::redact_url(&camera.url)
            );
        }
        log::info!(
            "known people: {}",
            pipeline.known_faces().names().join(", ")
        );
        log::info!(
            "results -> {} ({:?})",
            config.results.path.display(),
            config.results.store
        );
        log::info!("dry run complete; no cameras opened");
        return Ok(());
    }

    let signal = pipeline.signal();
    let buffer = pipeline.buffer();
    ctrlc::set_handler(move || {
        if signal.raise() {
            log::info!("interrupt received, shutting down");
        }
        buffer.notify_all();
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("facewatchd {} running", env!("CARGO_PKG_VERSION"));
    let report = pipeline.run_configured()?;

    if !report.stragglers.is_empty() {
        log::warn!("detached camera threads: {}", report.stragglers.join(", "));
    }
    log::info!(
        "{} results flushed, report sent: {}, frames appended/drained/dropped: {}/{}/{}",
        report.results_flushed,
        report.report_sent,
        report.buffer.appended,
        report.buffer.drained,
        report.buffer.dropped
    );
    Ok(())
}
