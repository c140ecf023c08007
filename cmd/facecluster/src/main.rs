//! facecluster - Administrative CLI for face and pet identity clusters.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use giztoy_facecluster::{ClusterId, ClusterKind};
use tracing_subscriber::EnvFilter;

mod commands;

/// facecluster - Inspect and curate identity clusters stored in a redb file.
///
/// Faces are ingested from JSON Lines, one analyzed image per line:
///   {"image": "img-1", "faces": [{"encoding": [0.1, ...], "confidence": 0.98}]}
#[derive(Parser, Debug)]
#[command(name = "facecluster")]
#[command(about = "Face and pet identity clustering CLI")]
#[command(version)]
pub struct Cli {
    /// Registry database file
    #[arg(long, global = true, default_value = "facecluster.redb")]
    pub db: PathBuf,

    /// Matching threshold, clamped to [0.4, 0.8]
    #[arg(long, global = true)]
    pub threshold: Option<f32>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest analyzed images from a JSON Lines file
    Ingest {
        /// Path to the .jsonl file
        file: PathBuf,
    },
    /// List all clusters
    List,
    /// Show one cluster and its faces
    Show { cluster: ClusterId },
    /// Merge ABSORB into KEEP
    Merge { keep: ClusterId, absorb: ClusterId },
    /// Delete a cluster, leaving its faces unassigned
    Delete { cluster: ClusterId },
    /// Name a cluster, or clear its name when NAME is omitted
    Rename {
        cluster: ClusterId,
        name: Option<String>,
    },
    /// Set what a cluster depicts (person, pet, unknown)
    #[command(name = "set-type")]
    SetType { cluster: ClusterId, kind: ClusterKind },
    /// Remove every face of a deleted image
    Forget { image: String },
    /// Rebuild all clusters from scratch
    Recluster,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::run(&cli)
}
