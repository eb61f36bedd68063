//!
//! Naming helpers for relation forks, used when describing WAL records.
//!
use crate::pg_constants;
use crate::RelFileNode;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
}

/// Convert Postgres relation file's fork suffix to fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(pg_constants::MAIN_FORKNUM),
        Some("fsm") => Ok(pg_constants::FSM_FORKNUM),
        Some("vm") => Ok(pg_constants::VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(pg_constants::INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// Convert Postgres fork number to the suffix of the relation data file.
/// Unknown fork numbers yield `None` as does the main fork.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        pg_constants::FSM_FORKNUM => Some("fsm"),
        pg_constants::VISIBILITYMAP_FORKNUM => Some("vm"),
        pg_constants::INIT_FORKNUM => Some("init"),
        _ => None,
    }
}

/// "spc/db/rel" with the fork suffix appended for non-main forks, in the
/// style of pg_waldump block references.
pub fn describe_block_ref(rnode: &RelFileNode, forknum: u8, blkno: u32) -> String {
    match forknumber_to_name(forknum) {
        Some(fork) => format!(
            "rel {}/{}/{} fork {} blk {}",
            rnode.spcnode, rnode.dbnode, rnode.relnode, fork, blkno
        ),
        None => format!(
            "rel {}/{}/{} blk {}",
            rnode.spcnode, rnode.dbnode, rnode.relnode, blkno
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_names() {
        assert_eq!(forkname_to_number(None), Ok(pg_constants::MAIN_FORKNUM));
        assert_eq!(forkname_to_number(Some("vm")), Ok(2));
        assert_eq!(
            forkname_to_number(Some("bogus")),
            Err(FilePathError::InvalidForkName)
        );
        assert_eq!(forknumber_to_name(1), Some("fsm"));
        assert_eq!(forknumber_to_name(0), None);
    }

    #[test]
    fn block_refs() {
        let rnode = RelFileNode {
            spcnode: 1663,
            dbnode: 5,
            relnode: 16384,
        };
        assert_eq!(describe_block_ref(&rnode, 0, 7), "rel 1663/5/16384 blk 7");
        assert_eq!(
            describe_block_ref(&rnode, 2, 0),
            "rel 1663/5/16384 fork vm blk 0"
        );
    }
}
