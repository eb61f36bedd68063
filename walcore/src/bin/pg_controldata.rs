//
// Print the control file of a cluster.
//
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use postgres_ffi::controlfile_utils::ControlFileVersion;
use tracing::*;
use utils::logging::{self, LogFormat, Output};
use walcore::controldata::format_control_data;
use walcore::controlfile::{control_file_path, get_controlfile_by_exact_path};

#[derive(Parser)]
#[command(name = "pg_controldata", version)]
#[command(about = "Display control information of a database cluster")]
struct Cli {
    /// Data directory of the cluster.
    #[arg(short = 'D', long = "pgdata", env = "PGDATA", value_name = "DATADIR")]
    pgdata: Option<PathBuf>,
    #[arg(value_name = "DATADIR", conflicts_with = "pgdata")]
    datadir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Plain, Output::Stderr)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    let data_dir = cli
        .datadir
        .or(cli.pgdata)
        .context("no data directory specified, use -D or set PGDATA")?;
    let path = control_file_path(&data_dir);
    let read = get_controlfile_by_exact_path(&path)
        .with_context(|| format!("could not read the control file of {}", data_dir.display()))?;

    if !read.crc_ok {
        warn!(
            "calculated CRC checksum does not match value stored in file; \
             either the file is corrupt, or it has a different layout than this program \
             is expecting, and the results below are untrustworthy"
        );
    }
    if read.byte_order_suspect {
        warn!("possible byte ordering mismatch: the control file may have been written on a host of the other endianness");
    }
    if read.version != ControlFileVersion::Current {
        warn!(
            "control file version {} is not the current one, fields missing from it are shown with default values",
            read.data.pg_control_version
        );
    }
    print!("{}", format_control_data(&read.data));
    Ok(())
}
