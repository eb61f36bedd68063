//! Building blocks shared by the WAL core crates: LSN arithmetic, binary
//! serialization helpers, crash-safe file operations, logging setup and the
//! signal latch.

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;
/// Utilities for binary serialization/deserialization
pub mod bin_ser;

/// Crash-safe file and directory manipulation (fsync, durable rename)
pub mod crashsafe;

pub mod logging;

/// Signal latch: async-signal-safe flags polled by the main loops
pub mod signals;

/// Inspect the server's pid file in a data directory
pub mod pid_file;
