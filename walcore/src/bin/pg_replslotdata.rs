//
// List the replication slots saved in a stopped cluster.
//
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::*;
use utils::logging::{self, LogFormat, Output};
use walcore::replslot::{format_slots, read_slots};

#[derive(Parser)]
#[command(name = "pg_replslotdata", version)]
#[command(about = "Display information about the replication slots of a database cluster")]
struct Cli {
    /// Data directory of the cluster.
    #[arg(short = 'D', long = "pgdata", env = "PGDATA", value_name = "DATADIR")]
    pgdata: Option<PathBuf>,
    #[arg(value_name = "DATADIR", conflicts_with = "pgdata")]
    datadir: Option<PathBuf>,
    /// Report every slot file as it is read.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    logging::init(LogFormat::Plain, Output::Stderr)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    let data_dir = cli
        .datadir
        .or(cli.pgdata)
        .context("no data directory specified, use -D or set PGDATA")?;
    let scan = read_slots(&data_dir)
        .with_context(|| format!("could not read the replication slots of {}", data_dir.display()))?;
    for skipped in &scan.skipped {
        warn!("skipping slot {}: {}", skipped.path.display(), skipped.error);
    }
    print!("{}", format_slots(&scan.slots));
    Ok(())
}
