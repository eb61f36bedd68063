use std::io;
use std::path::PathBuf;

use pg_tde::TdeError;
use postgres_ffi::controlfile_utils::ControlFileError;
use utils::lsn::Lsn;

/// Errors surfaced by the WAL core.
///
/// `Corruption` and `VersionMismatch` describe bad data on disk; `Overflow`
/// and `BadState` are caller bugs; `Conflict` never escapes
/// [`crate::assembler::RecordBuilder::insert`], which retries on it.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("could not access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid record at {lsn}: {msg}")]
    Corruption { lsn: Lsn, msg: String },
    #[error("incompatible {what}: {msg}")]
    VersionMismatch { what: &'static str, msg: String },
    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("record length {0} exceeds the maximum record size")]
    Overflow(usize),
    #[error("redo pointer moved to {0} while the record was assembled")]
    Conflict(Lsn),
    #[error("{0}")]
    BadState(String),
    #[error("replication connection: {0}")]
    Connection(String),
    #[error(transparent)]
    Tde(#[from] TdeError),
}

pub type WalResult<T> = Result<T, WalError>;

impl WalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> WalError {
        WalError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(lsn: Lsn, msg: impl Into<String>) -> WalError {
        WalError::Corruption {
            lsn,
            msg: msg.into(),
        }
    }

    pub(crate) fn bad_state(msg: impl Into<String>) -> WalError {
        WalError::BadState(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, WalError::Corruption { .. })
    }
}

impl From<ControlFileError> for WalError {
    fn from(e: ControlFileError) -> Self {
        match e {
            ControlFileError::BadCrc { .. } | ControlFileError::TooShort(_) => {
                WalError::corruption(Lsn::INVALID, format!("control file: {e}"))
            }
            other => WalError::VersionMismatch {
                what: "control file",
                msg: other.to_string(),
            },
        }
    }
}

/// Run an I/O operation, repeating it a bounded number of times when it is
/// interrupted by a signal.
pub(crate) fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    const MAX_ATTEMPTS: usize = 3;
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted && attempt < MAX_ATTEMPTS => {
                attempt += 1;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_io_is_retried_a_few_times() {
        let mut calls = 0;
        let res = retry_interrupted(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 3);

        let mut calls = 0;
        let res: io::Result<()> = retry_interrupted(|| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::Interrupted))
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }
}
