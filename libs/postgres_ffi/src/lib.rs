#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

//! PostgreSQL on-disk and WAL formats: page and record headers, the control
//! file, replication slot state files, and the decoding machinery built on
//! top of them.

use utils::lsn::Lsn;

pub mod controlfile_utils;
pub mod legacy;
pub mod page;
pub mod pg_constants;
mod pg_structs;
pub mod relfile_utils;
pub mod replslot;
pub mod waldecoder;
pub mod walrecord;
pub mod xlog_utils;

pub use pg_structs::*;

pub type Oid = u32;
pub type TransactionId = u32;
pub type MultiXactId = u32;
pub type MultiXactOffset = u32;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;
pub type BlockNumber = u32;
pub type RepOriginId = u16;
pub type RmgrId = u8;

pub const BLCKSZ: u16 = 8192;
pub const XLOG_BLCKSZ: usize = utils::lsn::XLOG_BLCKSZ as usize;
pub const WAL_SEGMENT_SIZE: usize = pg_constants::DEFAULT_WAL_SEG_SIZE;

/// Identifies a relation's storage: tablespace, database and relation file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileNode {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
}

//  See TransactionIdIsNormal in transam.h
pub const fn transaction_id_is_normal(id: TransactionId) -> bool {
    id >= pg_constants::FIRST_NORMAL_TRANSACTION_ID
}

// Check if page is not yet initialized (port of Postgres PageIsInit() macro)
pub fn page_is_new(pg: &[u8]) -> bool {
    pg[14] == 0 && pg[15] == 0 // pg_upper == 0
}

// ExtractLSN from page header
pub fn page_get_lsn(pg: &[u8]) -> Lsn {
    Lsn::from_parts(
        u32::from_le_bytes([pg[0], pg[1], pg[2], pg[3]]),
        u32::from_le_bytes([pg[4], pg[5], pg[6], pg[7]]),
    )
}

pub fn page_set_lsn(pg: &mut [u8], lsn: Lsn) {
    pg[0..4].copy_from_slice(&lsn.hi().to_le_bytes());
    pg[4..8].copy_from_slice(&lsn.lo().to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_lsn_roundtrip() {
        let mut page = vec![0u8; BLCKSZ as usize];
        assert!(page_is_new(&page));
        page_set_lsn(&mut page, Lsn(0x1_0000_2028));
        assert_eq!(&page[0..8], &[1, 0, 0, 0, 0x28, 0x20, 0, 0]);
        assert_eq!(page_get_lsn(&page), Lsn(0x1_0000_2028));
    }

    #[test]
    fn normal_xids() {
        assert!(!transaction_id_is_normal(2));
        assert!(transaction_id_is_normal(3));
    }
}
