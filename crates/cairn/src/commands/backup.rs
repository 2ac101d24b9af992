//! Back up a directory tree into a new generation

use std::path::PathBuf;

use clap::Args;

use cairn::{Options, create_backup};

/// Back up a directory tree into a new generation
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Directory to back up
    source: PathBuf,

    /// Backup root holding the generations
    destination: PathBuf,
}

pub fn run(
    args: BackupArgs,
    options: &Options,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stats = create_backup(&args.source, &args.destination, options)?;

    let prefix = if options.dry_run { "[dry run] " } else { "" };
    eprintln!("{prefix}Generation {} at {:?}", stats.generation, stats.generation_path);
    match &stats.previous {
        Some(previous) => eprintln!(
            "  Seeded from {previous} ({} linked, {} copied)",
            stats.seeded.linked, stats.seeded.copied
        ),
        None => eprintln!("  First backup"),
    }
    eprintln!(
        "  Files: {} ({} unchanged, {} rechunked)",
        stats.files, stats.unchanged, stats.rechunked
    );
    if stats.failed > 0 || stats.skipped > 0 {
        eprintln!("  Failed: {}, skipped: {}", stats.failed, stats.skipped);
    }
    if stats.pruned_files > 0 || stats.pruned_dirs > 0 {
        eprintln!(
            "  Pruned: {} files, {} directories",
            stats.pruned_files, stats.pruned_dirs
        );
    }
    eprintln!(
        "  Chunks: {} ({} literal, {} references)",
        stats.encoded.chunks, stats.encoded.literals, stats.encoded.references
    );
    eprintln!(
        "  Dedup ratio: {:.2}x ({:.1}% space saved, {} bytes)",
        stats.dedup_ratio(),
        stats.space_saved_pct(),
        stats.space_saved()
    );

    Ok(())
}
