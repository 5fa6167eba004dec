//! Process logging setup.
//!
//! `env_logger` with an `info` default (overridable via `RUST_LOG`). With a log
//! file configured, records are appended there as
//! `YYYY-MM-DD HH:MM:SS - LEVEL - message`; otherwise they go to stderr in the
//! usual env_logger format.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} - {} - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            });
    }

    builder.try_init().context("logger already initialized")?;
    Ok(())
}
