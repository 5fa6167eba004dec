//! faces_verify - check a known-face file before deploying it
//!
//! Validates the layout written by the offline embedding step (matching name and
//! encoding counts, one encoding dimension, finite values) and optionally reports
//! which known face a probe encoding would match.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use facewatch::recognize::{KnownFaceSet, DEFAULT_TOLERANCE};

#[derive(Parser, Debug)]
#[command(name = "faces_verify", about = "Validate a known-face encodings file")]
struct Args {
    /// Known-face JSON file
    #[arg(long, default_value = "dataset/face_encodings.json")]
    faces: PathBuf,

    /// Comma-separated encoding to match against the file
    #[arg(long, value_name = "F64,...")]
    probe: Option<String>,

    /// Match tolerance for --probe (inclusive)
    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let known = KnownFaceSet::load(&args.faces)?;
    println!(
        "{}: {} encodings, {} people, dimension {}",
        args.faces.display(),
        known.len(),
        known.names().len(),
        known.dimension()
    );
    for name in known.names() {
        println!("  {}", name);
    }

    if let Some(probe) = args.probe {
        let encoding = probe
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("invalid --probe value: {}", e))?;
        match known.best_match(&encoding, args.tolerance)? {
            Some(hit) => println!("probe matches {} (distance {:.4})", hit.name, hit.distance),
            None => println!("probe is unknown at tolerance {}", args.tolerance),
        }
    }
    Ok(())
}
