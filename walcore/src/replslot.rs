//!
//! Listing of the replication slots saved under `pg_replslot`, as printed
//! by `pg_replslotdata`.
//!
use std::fmt::Write;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use postgres_ffi::pg_constants;
use postgres_ffi::replslot::ReplicationSlotPersistentData;
use tracing::*;

use crate::error::{WalError, WalResult};

/// State file inside each slot directory.
const SLOT_STATE_FILE: &str = "state";

const COLUMNS: [&str; 12] = [
    "slot_name",
    "slot_type",
    "datoid",
    "persistency",
    "xmin",
    "catalog_xmin",
    "restart_lsn",
    "invalidated_at",
    "confirmed_flush",
    "two_phase_at",
    "two_phase",
    "plugin",
];

/// A slot directory whose state file could not be used.
#[derive(Debug)]
pub struct SkippedSlot {
    pub path: PathBuf,
    pub error: WalError,
}

#[derive(Debug, Default)]
pub struct SlotScan {
    /// Ordered by slot name.
    pub slots: Vec<ReplicationSlotPersistentData>,
    pub skipped: Vec<SkippedSlot>,
}

/// Read every `pg_replslot/*/state` file of `data_dir`. A missing
/// `pg_replslot` means there are no slots; unreadable slots are reported
/// in [`SlotScan::skipped`].
pub fn read_slots(data_dir: &Path) -> WalResult<SlotScan> {
    let dir = data_dir.join(pg_constants::REPLSLOT_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SlotScan::default()),
        Err(e) => return Err(WalError::io(&dir, e)),
    };

    let mut scan = SlotScan::default();
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io(&dir, e))?;
        let slot_dir = entry.path();
        // leftovers of a slot being created or dropped
        if entry.file_name().to_string_lossy().ends_with(".tmp") || !slot_dir.is_dir() {
            continue;
        }
        let path = slot_dir.join(SLOT_STATE_FILE);
        let res = fs::read(&path)
            .map_err(|e| WalError::io(&path, e))
            .and_then(|buf| {
                ReplicationSlotPersistentData::decode(&buf).map_err(|e| WalError::Corruption {
                    lsn: utils::lsn::Lsn::INVALID,
                    msg: format!("{}: {e}", path.display()),
                })
            });
        match res {
            Ok(slot) => {
                debug!("read slot {} from {}", slot.name, path.display());
                scan.slots.push(slot);
            }
            Err(error) => scan.skipped.push(SkippedSlot { path, error }),
        }
    }
    scan.slots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scan)
}

fn row(slot: &ReplicationSlotPersistentData) -> [String; 12] {
    [
        slot.name.clone(),
        slot.slot_type().to_string(),
        slot.database.to_string(),
        slot.persistency.to_string(),
        slot.xmin.to_string(),
        slot.catalog_xmin.to_string(),
        slot.restart_lsn.to_string(),
        slot.invalidated_at.to_string(),
        slot.confirmed_flush.to_string(),
        slot.two_phase_at.to_string(),
        (slot.two_phase as u8).to_string(),
        slot.plugin.clone(),
    ]
}

fn push_line<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, widths: &[usize]) {
    for (i, (cell, w)) in cells.zip(widths).enumerate() {
        if i > 0 {
            out.push_str(" | ");
        }
        if i + 1 == widths.len() {
            out.push_str(cell);
        } else {
            let _ = write!(out, "{cell:<width$}", width = *w);
        }
    }
    out.push('\n');
}

/// Table with a header line and one line per slot, columns padded to the
/// widest cell.
pub fn format_slots(slots: &[ReplicationSlotPersistentData]) -> String {
    let rows: Vec<[String; 12]> = slots.iter().map(row).collect();
    let mut widths = COLUMNS.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    push_line(&mut out, COLUMNS.iter().copied(), &widths);
    for r in &rows {
        push_line(&mut out, r.iter().map(String::as_str), &widths);
    }
    out
}
