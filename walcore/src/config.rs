//! Settings of a WAL subsystem instance.
//!
//! Read from a TOML file; every field has a default, so an empty file is a
//! valid configuration for a cluster at `data_dir`.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::IsValidWalSegSize;
use serde::{Deserialize, Serialize};

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_INSERTION_SLOTS: usize = 8;
    /// In-memory WAL ring size in pages.
    pub const DEFAULT_WAL_BUFFERS: usize = 512;
    pub const DEFAULT_WAL_WRITER_DELAY: Duration = Duration::from_millis(200);
    pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_RECEIVER_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_KEY_DIR: &str = "pg_tde";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalConfig {
    pub data_dir: Utf8PathBuf,
    /// Bytes per segment file: a power of two between 1 MiB and 1 GiB.
    pub wal_segment_size: usize,
    /// Number of concurrent inserters that can copy into the ring at once.
    pub insertion_slots: usize,
    pub wal_buffers: usize,
    pub full_page_writes: bool,
    /// Skip fsync. Only for tests.
    pub no_sync: bool,
    /// Encrypt new WAL with keys from the TDE key files.
    pub encrypt_wal: bool,
    /// Directory of the TDE key files, relative to `data_dir` unless absolute.
    pub key_dir: Utf8PathBuf,
    /// JSON file keyring that holds the principal keys.
    pub keyring_file: Option<Utf8PathBuf>,
    /// Leave `.ready` markers for completed segments.
    pub archive_mode: bool,
    #[serde(with = "humantime_serde")]
    pub wal_writer_delay: Duration,
    /// Zero disables periodic status replies.
    #[serde(with = "humantime_serde")]
    pub wal_receiver_status_interval: Duration,
    /// Give up on a silent primary after this long; zero waits forever.
    #[serde(with = "humantime_serde")]
    pub wal_receiver_timeout: Duration,
    /// Report the standby's oldest xmin to the primary.
    pub hot_standby_feedback: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            data_dir: Utf8PathBuf::from("./"),
            wal_segment_size: pg_constants::DEFAULT_WAL_SEG_SIZE,
            insertion_slots: defaults::DEFAULT_INSERTION_SLOTS,
            wal_buffers: defaults::DEFAULT_WAL_BUFFERS,
            full_page_writes: true,
            no_sync: false,
            encrypt_wal: false,
            key_dir: Utf8PathBuf::from(defaults::DEFAULT_KEY_DIR),
            keyring_file: None,
            archive_mode: false,
            wal_writer_delay: defaults::DEFAULT_WAL_WRITER_DELAY,
            wal_receiver_status_interval: defaults::DEFAULT_STATUS_INTERVAL,
            wal_receiver_timeout: defaults::DEFAULT_RECEIVER_TIMEOUT,
            hot_standby_feedback: false,
        }
    }
}

impl WalConfig {
    /// Defaults for a cluster at `data_dir`.
    pub fn for_data_dir(data_dir: impl Into<Utf8PathBuf>) -> WalConfig {
        WalConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn parse(toml_text: &str) -> anyhow::Result<WalConfig> {
        let conf: WalConfig = toml::from_str(toml_text).context("could not parse WAL config")?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<WalConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {path}"))?;
        Self::parse(&text).with_context(|| format!("in config file {path}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            IsValidWalSegSize(self.wal_segment_size),
            "wal_segment_size {} is not a power of two between 1 MiB and 1 GiB",
            self.wal_segment_size
        );
        anyhow::ensure!(self.insertion_slots > 0, "insertion_slots must be positive");
        // The ring holds at least a few pages past whatever is being written out.
        anyhow::ensure!(self.wal_buffers >= 4, "wal_buffers must be at least 4");
        Ok(())
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.data_dir.join(pg_constants::XLOGDIR)
    }

    pub fn control_file_path(&self) -> Utf8PathBuf {
        self.data_dir.join(pg_constants::XLOG_CONTROL_FILE)
    }

    pub fn key_dir(&self) -> Utf8PathBuf {
        if self.key_dir.is_absolute() {
            self.key_dir.clone()
        } else {
            self.data_dir.join(&self.key_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let conf = WalConfig::parse("").unwrap();
        assert_eq!(conf, WalConfig::default());
    }

    #[test]
    fn parse_durations_and_sizes() {
        let conf = WalConfig::parse(
            r#"
            data_dir = "/var/lib/pg"
            wal_segment_size = 1048576
            encrypt_wal = true
            wal_writer_delay = "50ms"
            wal_receiver_status_interval = "1m"
            "#,
        )
        .unwrap();
        assert_eq!(conf.wal_segment_size, 1 << 20);
        assert!(conf.encrypt_wal);
        assert_eq!(conf.wal_writer_delay, Duration::from_millis(50));
        assert_eq!(conf.wal_receiver_status_interval, Duration::from_secs(60));
        assert_eq!(conf.wal_dir(), Utf8PathBuf::from("/var/lib/pg/pg_wal"));
        assert_eq!(conf.key_dir(), Utf8PathBuf::from("/var/lib/pg/pg_tde"));
    }

    #[test]
    fn reject_bad_segment_size() {
        let err = WalConfig::parse("wal_segment_size = 3000000").unwrap_err();
        assert!(format!("{err:#}").contains("power of two"), "{err:#}");
        assert!(WalConfig::parse("no_such_setting = 1").is_err());
    }
}
