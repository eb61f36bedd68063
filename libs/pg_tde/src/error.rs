use std::io;
use std::path::PathBuf;

use postgres_ffi::Oid;

#[derive(Debug, thiserror::Error)]
pub enum TdeError {
    #[error("could not access key file \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key file \"{path}\" is corrupted: {msg}")]
    Corrupted { path: PathBuf, msg: String },

    #[error("no principal key configured for database {0}")]
    NoPrincipalKey(Oid),

    #[error("principal key \"{name}\" not found in the keyring")]
    KeyNotInKeyring { name: String },

    #[error("failed to verify principal key header for key \"{name}\": incorrect principal key or corrupted key file")]
    PrincipalKeyMismatch { name: String },

    #[error("failed to decrypt key: {0}")]
    Decrypt(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("could not WAL-log key change")]
    Xlog(#[source] anyhow::Error),
}

impl TdeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> TdeError {
        TdeError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(path: impl Into<PathBuf>, msg: impl Into<String>) -> TdeError {
        TdeError::Corrupted {
            path: path.into(),
            msg: msg.into(),
        }
    }
}

pub type TdeResult<T> = Result<T, TdeError>;
