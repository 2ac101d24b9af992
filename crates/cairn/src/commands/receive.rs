//! Receive a generation from a sending host

use std::path::PathBuf;

use clap::Args;

use cairn::{Options, transport};

/// Wait for one generation from a host running `send`
#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Backup root to store the generation in
    root: PathBuf,

    /// Address to listen on, HOST:PORT
    #[arg(long, short = 'l', default_value = "0.0.0.0:7878")]
    listen: String,
}

pub fn run(
    args: ReceiveArgs,
    options: &Options,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stats = transport::receive(args.listen.as_str(), &args.root, options)?;

    let prefix = if options.dry_run { "[dry run] " } else { "" };
    eprintln!("{prefix}Received {} into {:?}", stats.generation, args.root);
    eprintln!(
        "  Files: {}, directories: {}, bytes: {}",
        stats.files, stats.dirs, stats.bytes
    );
    if stats.installed_manifest {
        eprintln!("  Now the latest generation");
    }
    Ok(())
}
