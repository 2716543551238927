use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use maxillo_seg::volume::SplitManifest;

/// Write a random train/val/test split manifest for a dataset directory.
#[derive(Parser)]
#[command(name = "make_split", about = "Generate a split manifest from subject folders")]
struct Cli {
    /// Dataset root containing one folder per subject
    dataset: PathBuf,

    /// Output JSON path
    #[arg(long, default_value = "splits.json")]
    output: PathBuf,

    /// Shuffle seed
    #[arg(long, default_value_t = 47)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let entries = std::fs::read_dir(&cli.dataset)
        .with_context(|| format!("listing {}", cli.dataset.display()))?;
    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            folders.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    if folders.is_empty() {
        bail!("no subject folders under {}", cli.dataset.display());
    }
    folders.sort();

    let manifest = SplitManifest::random(folders, cli.seed);
    manifest
        .save(&cli.output)
        .with_context(|| format!("writing {}", cli.output.display()))?;
    println!(
        "train: {}  val: {}  test: {}  -> {}",
        manifest.train.len(),
        manifest.val.len(),
        manifest.test.len(),
        cli.output.display()
    );
    Ok(())
}
