//! Subcommand implementations.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use giztoy_facecluster::{Config, FaceInput, Manager, RedbStore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Cli, Commands};

/// One analyzed image in an ingest file.
#[derive(Debug, Deserialize)]
pub struct ImageRecord {
    pub image: String,
    #[serde(default)]
    pub faces: Vec<FaceInput>,
}

#[derive(Debug, Serialize)]
struct IngestReport {
    images: usize,
    faces: usize,
    clusters: usize,
}

pub fn run(cli: &Cli) -> Result<()> {
    let mgr = open_manager(cli)?;

    match &cli.command {
        Commands::Ingest { file } => {
            let records = read_records(file)?;
            let report = ingest(&mgr, &records)?;
            output_result(&report, cli.json)
        }
        Commands::List => output_result(&mgr.clusters(), cli.json),
        Commands::Show { cluster } => {
            let c = mgr
                .cluster(*cluster)
                .with_context(|| format!("{cluster} not found"))?;
            let faces = mgr.faces_in(*cluster)?;
            if cli.json {
                let value = serde_json::json!({ "cluster": c.summary(), "faces": faces });
                return output_result(&value, true);
            }
            output_result(&c.summary(), false)?;
            for f in faces {
                println!("  {} image={} confidence={:.3}", f.id, f.image_id, f.confidence);
            }
            Ok(())
        }
        Commands::Merge { keep, absorb } => {
            let merged = mgr.merge_clusters(*keep, *absorb)?;
            output_result(&merged.summary(), cli.json)
        }
        Commands::Delete { cluster } => {
            let released = mgr.delete_cluster(*cluster)?;
            print_success(&format!("Deleted {cluster}, released {} face(s)", released.len()));
            Ok(())
        }
        Commands::Rename { cluster, name } => {
            let c = mgr.rename_cluster(*cluster, name.as_deref())?;
            output_result(&c.summary(), cli.json)
        }
        Commands::SetType { cluster, kind } => {
            let c = mgr.set_type(*cluster, *kind)?;
            output_result(&c.summary(), cli.json)
        }
        Commands::Forget { image } => {
            let n = mgr.forget_image(image)?;
            print_success(&format!("Removed {n} face(s) of {image}"));
            Ok(())
        }
        Commands::Recluster => {
            let n = mgr.recluster_all()?;
            print_success(&format!("Rebuilt {n} cluster(s)"));
            Ok(())
        }
    }
}

fn open_manager(cli: &Cli) -> Result<Manager> {
    let store = RedbStore::open(&cli.db)
        .with_context(|| format!("failed to open {}", cli.db.display()))?;
    let mgr = Manager::open(Config::default(), Box::new(store))?;
    if let Some(t) = cli.threshold {
        mgr.set_threshold(t);
    }
    Ok(mgr)
}

/// Reads an ingest file. Blank lines are skipped.
pub fn read_records(path: &Path) -> Result<Vec<ImageRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_records(BufReader::new(file))
}

pub fn parse_records(reader: impl BufRead) -> Result<Vec<ImageRecord>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ImageRecord =
            serde_json::from_str(&line).with_context(|| format!("line {}: invalid record", i + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn ingest(mgr: &Manager, records: &[ImageRecord]) -> Result<IngestReport> {
    let mut faces = 0;
    for record in records {
        let assigned = mgr
            .process_faces(&record.image, &record.faces)
            .with_context(|| format!("image {}", record.image))?;
        faces += assigned.len();
    }
    info!(images = records.len(), faces, "ingest finished");
    Ok(IngestReport {
        images: records.len(),
        faces,
        clusters: mgr.clusters().len(),
    })
}

fn output_result<T: Serialize + std::fmt::Debug>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

fn print_success(msg: &str) {
    eprintln!("✓ {msg}");
}
