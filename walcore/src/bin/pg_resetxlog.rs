//
// Reset the write-ahead log of a stopped cluster, or rebuild its control
// file from the WAL that is left.
//
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use utils::logging::{self, LogFormat, Output};
use walcore::resetwal::{
    apply_reset, check_not_running, plan_reset, restore, show, ControlSource, MinWalLocation,
    ResetOptions,
};

#[derive(Parser)]
#[command(name = "pg_resetxlog", version)]
#[command(about = "Reset the write-ahead log and other control information of a database cluster")]
struct Cli {
    /// Data directory of the cluster.
    #[arg(short = 'D', long = "pgdata", env = "PGDATA", value_name = "DATADIR")]
    pgdata: Option<PathBuf>,
    #[arg(value_name = "DATADIR", conflicts_with = "pgdata")]
    datadir: Option<PathBuf>,

    /// Force the update to be done.
    #[arg(short = 'f', long)]
    force: bool,
    /// No update, just show what would be done.
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
    /// Only rebuild the control file from the WAL, keep the WAL.
    #[arg(short = 'r', long)]
    restore: bool,

    /// Next transaction ID.
    #[arg(short = 'x', long = "next-transaction-id", value_name = "XID", value_parser = parse_number)]
    next_xid: Option<u32>,
    /// Next transaction ID epoch.
    #[arg(short = 'e', long = "epoch", value_name = "XIDEPOCH", value_parser = parse_number)]
    xid_epoch: Option<u32>,
    /// Oldest transaction ID.
    #[arg(short = 'u', long = "oldest-transaction-id", value_name = "XID", value_parser = parse_number)]
    oldest_xid: Option<u32>,
    /// Next OID.
    #[arg(short = 'o', long = "next-oid", value_name = "OID", value_parser = parse_number)]
    next_oid: Option<u32>,
    /// Next and oldest multitransaction ID.
    #[arg(short = 'm', long = "multixact-ids", value_name = "MXID[,MXID]", value_parser = parse_multi)]
    next_multi: Option<(u32, Option<u32>)>,
    /// Next multitransaction offset.
    #[arg(short = 'O', long = "multixact-offset", value_name = "OFFSET", value_parser = parse_number)]
    next_multi_offset: Option<u32>,
    /// Oldest and newest transaction IDs bearing a commit timestamp.
    #[arg(short = 'c', long = "commit-timestamp-ids", value_name = "XID,XID", value_parser = parse_pair)]
    commit_ts_xids: Option<(u32, u32)>,
    /// Minimum starting location for the new WAL: TLI,LOG,SEG or a WAL file name.
    #[arg(short = 'l', long = "next-wal-file", value_name = "WALFILE")]
    min_wal: Option<MinWalLocation>,
    /// Size of WAL segments, in megabytes.
    #[arg(long = "wal-segsize", value_name = "SIZE")]
    wal_segsize_mb: Option<usize>,
    /// Do not fsync written files.
    #[arg(long)]
    no_sync: bool,
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid argument \"{s}\": {e}"))
}

fn parse_multi(s: &str) -> Result<(u32, Option<u32>), String> {
    match s.split_once(',') {
        Some((next, oldest)) => Ok((parse_number(next)?, Some(parse_number(oldest)?))),
        None => Ok((parse_number(s)?, None)),
    }
}

fn parse_pair(s: &str) -> Result<(u32, u32), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("invalid argument \"{s}\": expected two comma-separated values"))?;
    Ok((parse_number(a)?, parse_number(b)?))
}

impl Cli {
    fn reset_options(&self) -> ResetOptions {
        ResetOptions {
            force: self.force,
            dry_run: self.dry_run,
            next_xid: self.next_xid,
            xid_epoch: self.xid_epoch,
            oldest_xid: self.oldest_xid,
            next_oid: self.next_oid,
            next_multi: self.next_multi,
            next_multi_offset: self.next_multi_offset,
            commit_ts_xids: self.commit_ts_xids,
            min_wal: self.min_wal,
            wal_seg_size: self.wal_segsize_mb.map(|mb| mb * 1024 * 1024),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Plain, Output::Stderr)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    let opts = cli.reset_options();
    let data_dir = cli
        .datadir
        .or(cli.pgdata)
        .context("no data directory specified, use -D or set PGDATA")?;

    if cli.restore {
        if opts.dry_run {
            print!("{}", show(&data_dir)?);
            return Ok(());
        }
        let restored = restore(&data_dir, &opts, cli.no_sync)?;
        println!("Control file restored ({:?})", restored.source);
        return Ok(());
    }

    if !opts.force {
        check_not_running(&data_dir)?;
    }
    let plan = plan_reset(&data_dir, &opts, None)?;
    if opts.dry_run {
        print!("{}", plan.describe_current());
        print!("{}", plan.describe_changes());
        return Ok(());
    }
    if (plan.guessed || plan.source != ControlSource::File) && !opts.force {
        // let the operator judge the recovered values before forcing them
        print!("{}", plan.describe_current());
    }
    apply_reset(&data_dir, &plan, &opts, cli.no_sync)?;
    println!("Write-ahead log reset");
    Ok(())
}
