use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;

use cairn::Options;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(about = "Incremental deduplicating backups")]
struct Args {
    /// Report what would be done without touching the disk
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Backup(commands::backup::BackupArgs),
    Restore(commands::restore::RestoreArgs),
    List(commands::list::ListArgs),
    Send(commands::send::SendArgs),
    Receive(commands::receive::ReceiveArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    let options = Options {
        dry_run: args.dry_run,
    };

    match args.command {
        Command::Backup(cmd) => commands::backup::run(cmd, &options),
        Command::Restore(cmd) => commands::restore::run(cmd, &options),
        Command::List(cmd) => commands::list::run(cmd),
        Command::Send(cmd) => commands::send::run(cmd),
        Command::Receive(cmd) => commands::receive::run(cmd, &options),
    }
}
