//! Restore a generation

use std::path::PathBuf;

use clap::Args;

use cairn::{Options, restore_backup};

/// Restore the files of a generation
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Generation directory to restore from
    generation: PathBuf,

    /// Where to write the restored files (defaults to the current directory)
    destination: Option<PathBuf>,
}

pub fn run(
    args: RestoreArgs,
    options: &Options,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let destination = match args.destination {
        Some(destination) => destination,
        None => std::env::current_dir()?,
    };
    let stats = restore_backup(&args.generation, &destination, options)?;

    let prefix = if options.dry_run { "[dry run] " } else { "" };
    eprintln!("{prefix}Restored {} into {:?}", stats.generation, destination);
    eprintln!(
        "  Files: {} restored, {} missing, {} failed",
        stats.restored, stats.missing, stats.failed
    );
    eprintln!("  Bytes written: {}", stats.bytes_written);

    stats.check()?;
    Ok(())
}
