//! Send a generation to a receiving host

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use cairn::{latest_generation, transport};

/// Send a generation to a host running `receive`
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Backup root holding the generation
    root: PathBuf,

    /// Receiver address, HOST:PORT
    address: String,

    /// Generation to send (defaults to the latest)
    #[arg(long, short = 'g')]
    generation: Option<String>,
}

pub fn run(args: SendArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let generation = match args.generation {
        Some(generation) => generation,
        None => latest_generation(&args.root)?
            .ok_or_else(|| format!("no generations in {:?}", args.root))?,
    };
    info!(%generation, address = %args.address, "Sending");

    let stats = transport::send(args.address.as_str(), &args.root, &generation)?;

    eprintln!("Sent {} to {}", stats.generation, args.address);
    eprintln!(
        "  Files: {}, directories: {}, bytes: {}",
        stats.files, stats.dirs, stats.bytes
    );
    Ok(())
}
