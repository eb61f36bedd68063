//! The write-ahead log core of a PostgreSQL-style cluster: record assembly
//! and insertion, segment files, the optional WAL encryption layer, the
//! control file, resource manager dispatch, the WAL receiver protocol and
//! the offline tools built on top of them.

pub mod assembler;
pub mod config;
pub mod controldata;
pub mod controlfile;
pub mod crypt;
pub mod error;
pub mod reader;
pub mod replslot;
pub mod resetwal;
pub mod rmgr;
pub mod segment;
pub mod subsystem;
pub mod timeline;
pub mod walreceiver;
pub mod writer;

pub use config::WalConfig;
pub use error::{WalError, WalResult};
pub use subsystem::WalSubsystem;
