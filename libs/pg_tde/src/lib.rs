//! Transparent data encryption keys: principal keys from a keyring,
//! per-relation and per-WAL-range internal keys wrapped under them, and the
//! files and WAL records that persist those.

pub mod encryption;
pub mod error;
pub mod key_cache;
pub mod keymap;
pub mod manager;
pub mod principal_key;
pub mod wal_keys;
pub mod xlog;

pub use encryption::InternalKey;
pub use error::{TdeError, TdeResult};
pub use keymap::KeyType;
pub use manager::{TdeKeyManager, GLOBAL_DATA_TDE_OID};
pub use principal_key::{FileKeyring, PrincipalKey, PrincipalKeyProvider};
pub use wal_keys::{WalKeyRange, WalKeyType};
pub use xlog::{KeyMapXLog, TdeRecord};
