//! On-disk header layout.
//!
//! Page 0 holds the header:
//! * (8 bytes) magic number
//! * (4 bytes) format version
//! * (4 bytes) page size
//! * (40 bytes) commit slot 0
//! * (40 bytes) commit slot 1
//!
//! Commit slot format is:
//! * (8 bytes) txn_id
//! * (8 bytes) root page number, 0 if the tree is empty
//! * (8 bytes) next free page (high-water mark)
//! * (8 bytes) first free list page, 0 if there is none
//! * (4 bytes) crc32 of the preceding 32 bytes
//! * (4 bytes) padding
//!
//! All integers are big-endian. The valid slot with the larger txn_id is the
//! committed state; transaction `t` always writes slot `t % 2`, so the other
//! slot keeps the previous commit until the write is durable.

use crate::error::{Error, Result};
use crate::types::PageNumber;
use std::convert::TryInto;

const MAGICNUMBER: [u8; 8] = *b"radbobj\0";
pub(crate) const FILE_FORMAT_VERSION: u32 = 1;

const VERSION_OFFSET: usize = MAGICNUMBER.len();
const PAGE_SIZE_OFFSET: usize = VERSION_OFFSET + 4;
const SLOTS_OFFSET: usize = PAGE_SIZE_OFFSET + 4;
const SLOT_SIZE: usize = 40;
const SLOT_CHECKSUMMED: usize = 32;
pub(crate) const HEADER_SIZE: usize = SLOTS_OFFSET + 2 * SLOT_SIZE;

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[offset..(offset + 8)]);
    u64::from_be_bytes(buf)
}

/// One committed state of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitSlot {
    pub(crate) txn_id: u64,
    pub(crate) root: Option<PageNumber>,
    pub(crate) next_free_page: PageNumber,
    pub(crate) freelist_head: Option<PageNumber>,
}

impl CommitSlot {
    /// State of a freshly initialized file: empty tree, only the header page used.
    pub(crate) fn empty() -> Self {
        CommitSlot {
            txn_id: 0,
            root: None,
            next_free_page: 1,
            freelist_head: None,
        }
    }

    fn to_bytes(self, output: &mut [u8]) {
        output[0..8].copy_from_slice(&self.txn_id.to_be_bytes());
        output[8..16].copy_from_slice(&self.root.unwrap_or(0).to_be_bytes());
        output[16..24].copy_from_slice(&self.next_free_page.to_be_bytes());
        output[24..32].copy_from_slice(&self.freelist_head.unwrap_or(0).to_be_bytes());
        let checksum = crc32fast::hash(&output[0..SLOT_CHECKSUMMED]);
        output[32..36].copy_from_slice(&checksum.to_be_bytes());
        output[36..40].fill(0);
    }

    // Returns None if the checksum does not match, e.g. after a torn write
    fn from_bytes(raw: &[u8]) -> Option<Self> {
        let stored = u32::from_be_bytes(raw[32..36].try_into().ok()?);
        if crc32fast::hash(&raw[0..SLOT_CHECKSUMMED]) != stored {
            return None;
        }
        let root = read_u64(raw, 8);
        let freelist_head = read_u64(raw, 24);
        Some(CommitSlot {
            txn_id: read_u64(raw, 0),
            root: (root != 0).then_some(root),
            next_free_page: read_u64(raw, 16),
            freelist_head: (freelist_head != 0).then_some(freelist_head),
        })
    }
}

fn slot_range(txn_id: u64) -> std::ops::Range<usize> {
    let start = SLOTS_OFFSET + (txn_id % 2) as usize * SLOT_SIZE;
    start..(start + SLOT_SIZE)
}

pub(crate) fn is_initialized(mem: &[u8]) -> bool {
    mem.len() >= HEADER_SIZE && mem[0..MAGICNUMBER.len()] == MAGICNUMBER
}

/// True if no magic number was ever written: an empty file, or one whose
/// initialization was interrupted before it completed.
pub(crate) fn is_blank(mem: &[u8]) -> bool {
    mem[0..MAGICNUMBER.len()].iter().all(|b| *b == 0)
}

/// Writes everything but the magic number. The caller must flush and then
/// call [`write_magic`], so that a crash part way through never leaves a file
/// that looks initialized.
pub(crate) fn initialize(mem: &mut [u8], page_size: usize) {
    mem[0..HEADER_SIZE].fill(0);
    mem[VERSION_OFFSET..(VERSION_OFFSET + 4)].copy_from_slice(&FILE_FORMAT_VERSION.to_be_bytes());
    mem[PAGE_SIZE_OFFSET..(PAGE_SIZE_OFFSET + 4)]
        .copy_from_slice(&(page_size as u32).to_be_bytes());
    let empty = CommitSlot::empty();
    empty.to_bytes(&mut mem[slot_range(empty.txn_id)]);
}

pub(crate) fn write_magic(mem: &mut [u8]) {
    mem[0..MAGICNUMBER.len()].copy_from_slice(&MAGICNUMBER);
}

/// Reads the page size recorded in an initialized header.
pub(crate) fn read_page_size(mem: &[u8]) -> Result<usize> {
    let version = u32::from_be_bytes(
        mem[VERSION_OFFSET..(VERSION_OFFSET + 4)]
            .try_into()
            .map_err(|_| Error::Corrupted("truncated header".to_string()))?,
    );
    if version != FILE_FORMAT_VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported file format version {version}"
        )));
    }
    let page_size = u32::from_be_bytes(
        mem[PAGE_SIZE_OFFSET..(PAGE_SIZE_OFFSET + 4)]
            .try_into()
            .map_err(|_| Error::Corrupted("truncated header".to_string()))?,
    ) as usize;
    if !page_size.is_power_of_two() || page_size < HEADER_SIZE {
        return Err(Error::Corrupted(format!("invalid page size {page_size}")));
    }
    Ok(page_size)
}

/// Returns the committed slot: the valid one with the larger txn_id.
pub(crate) fn read_commit_slot(mem: &[u8]) -> Result<CommitSlot> {
    let first = CommitSlot::from_bytes(&mem[slot_range(0)]);
    let second = CommitSlot::from_bytes(&mem[slot_range(1)]);
    match (first, second) {
        (Some(a), Some(b)) => Ok(if a.txn_id >= b.txn_id { a } else { b }),
        (Some(slot), None) | (None, Some(slot)) => Ok(slot),
        (None, None) => Err(Error::Corrupted(
            "both commit slots failed their checksum".to_string(),
        )),
    }
}

/// Returns the commit before `current` if its slot is intact. The slot is
/// the one the next transaction overwrites.
pub(crate) fn read_previous_slot(mem: &[u8], current: &CommitSlot) -> Option<CommitSlot> {
    let previous = CommitSlot::from_bytes(&mem[slot_range(current.txn_id + 1)])?;
    (previous.txn_id + 1 == current.txn_id && previous.next_free_page <= current.next_free_page)
        .then_some(previous)
}

pub(crate) fn write_commit_slot(mem: &mut [u8], slot: CommitSlot) {
    slot.to_bytes(&mut mem[slot_range(slot.txn_id)]);
}

/// Raw bytes of the slot that transaction `txn_id` writes.
pub(crate) fn commit_slot_bytes(mem: &[u8], txn_id: u64) -> [u8; SLOT_SIZE] {
    let mut raw = [0u8; SLOT_SIZE];
    raw.copy_from_slice(&mem[slot_range(txn_id)]);
    raw
}

pub(crate) fn restore_commit_slot(mem: &mut [u8], txn_id: u64, raw: &[u8; SLOT_SIZE]) {
    mem[slot_range(txn_id)].copy_from_slice(raw);
}
