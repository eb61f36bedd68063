//! Inspect a server pid file (`postmaster.pid`) without taking it over.
//!
//! Offline tools must not touch a data directory while a server owns it.
//! The file holds the owner's pid on its first line; a file whose pid no
//! longer names a live process is stale but still blocks the tools until an
//! operator removes it.

use std::{fs, io, path::Path};

use nix::{sys::signal::kill, unistd::Pid};

#[derive(Debug, PartialEq, Eq)]
pub enum PidFileRead {
    /// No pid file, the directory is free.
    NotExist,
    /// The file exists but its owner is gone (or the content is unreadable).
    Stale(Option<Pid>),
    /// The file names a live process.
    HeldByProcess(Pid),
}

pub fn read(path: &Path) -> io::Result<PidFileRead> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidFileRead::NotExist),
        Err(e) => return Err(e),
    };

    let pid = content
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw);

    Ok(match pid {
        // Signal 0 only checks for existence and permission.
        Some(pid) if kill(pid, None).is_ok() => PidFileRead::HeldByProcess(pid),
        other => PidFileRead::Stale(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn pid_file_states() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("postmaster.pid");

        assert_eq!(read(path.as_std_path()).unwrap(), PidFileRead::NotExist);

        std::fs::write(&path, format!("{}\n/data\n", std::process::id())).unwrap();
        assert_eq!(
            read(path.as_std_path()).unwrap(),
            PidFileRead::HeldByProcess(Pid::this())
        );

        std::fs::write(&path, "garbage\n").unwrap();
        assert_eq!(read(path.as_std_path()).unwrap(), PidFileRead::Stale(None));
    }
}
