use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{self, CommitSlot};
use crate::types::PageNumber;
use memmap2::MmapMut;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::convert::TryInto;
use std::fs::File;
use tracing::{debug, warn};

// Free list page format is:
// * (4 bytes) count
// * (8 bytes) next free list page, 0 for the last one
// * (count * 8 bytes) free page numbers
//
// A page number with HELD set was retired by the commit that wrote the list.
// The previous commit can still reach it, so it is not reused until a later
// commit.
const FREELIST_HEADER: usize = 12;
const HELD: u64 = 1 << 63;

pub(crate) struct Page<'a> {
    mem: MappedRwLockReadGuard<'a, [u8]>,
    page_number: PageNumber,
}

impl<'a> Page<'a> {
    pub(crate) fn memory(&self) -> &[u8] {
        &self.mem
    }

    pub(crate) fn get_page_number(&self) -> PageNumber {
        self.page_number
    }
}

/// Counters describing how the file's pages are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    /// Pages below the high-water mark, header included.
    pub allocated: u64,
    /// Pages ready for reuse.
    pub free: u64,
    /// Pages superseded by a commit but still reachable from a live snapshot.
    pub pending: u64,
}

struct Checkpoint {
    next_free_page: PageNumber,
    free: BTreeSet<PageNumber>,
}

struct Allocator {
    next_free_page: PageNumber, // high-water mark: pages at or above it were never used
    last_commit: u64,
    free: BTreeSet<PageNumber>,
    // pages retired by the commit with the given txn_id, waiting for older snapshots to go away
    pending: BTreeMap<u64, Vec<PageNumber>>,
    // pages holding the free list of the last commit
    freelist_pages: Vec<PageNumber>,
    // pages allocated by the active write transaction; safe to overwrite in place
    dirty: HashSet<PageNumber>,
    // committed pages the active write transaction no longer references
    retired: Vec<PageNumber>,
    checkpoint: Option<Checkpoint>,
}

impl Allocator {
    fn new(slot: &CommitSlot) -> Self {
        Allocator {
            next_free_page: slot.next_free_page,
            last_commit: slot.txn_id,
            free: BTreeSet::new(),
            pending: BTreeMap::new(),
            freelist_pages: vec![],
            dirty: HashSet::new(),
            retired: vec![],
            checkpoint: None,
        }
    }

    fn retire(&mut self, page_number: PageNumber) {
        if self.dirty.remove(&page_number) {
            // never committed, so no snapshot can reach it
            self.free.insert(page_number);
        } else {
            self.retired.push(page_number);
        }
    }
}

/// The page store: fixed-size pages in one memory-mapped file.
///
/// Pages reachable from a committed root are never modified. A write
/// transaction copies every page it changes to a page that no committed root
/// or live snapshot can reach, and a commit publishes the new root by writing
/// one header slot.
pub(crate) struct PageManager {
    mmap: RwLock<MmapMut>,
    page_size: usize,
    capacity: u64, // pages in the mapped region
    fsync_enabled: bool,
    allocator: Mutex<Allocator>,
}

impl PageManager {
    /// Maps `file`, initializing it if it is empty, and returns the committed state.
    pub(crate) fn open(file: &File, config: &Config) -> Result<(PageManager, CommitSlot)> {
        let file_len = file.metadata()?.len();
        let mut region = config.region_size;
        // Ensure that the region is a multiple of the page size, which is required by mmap
        region -= region % config.page_size as u64;
        if file_len < region {
            file.set_len(region)?;
        }

        // SAFETY: Database::open requires that no other process modifies or
        // truncates the file while it is mapped.
        let mut mmap = unsafe { MmapMut::map_mut(file)? };
        if !storage::is_initialized(&mmap) {
            if !storage::is_blank(&mmap) {
                return Err(Error::Corrupted(
                    "file is not a radarstore database".to_string(),
                ));
            }
            storage::initialize(&mut mmap, config.page_size);
            mmap.flush()?;
            // Write the magic number only after the header is on disk, so
            // that initialization is crash safe
            storage::write_magic(&mut mmap);
            mmap.flush()?;
            debug!(page_size = config.page_size, "initialized database file");
        }

        let page_size = storage::read_page_size(&mmap)?;
        let slot = storage::read_commit_slot(&mmap)?;
        let capacity = mmap.len() as u64 / page_size as u64;
        if slot.next_free_page > capacity {
            return Err(Error::Corrupted(format!(
                "high-water mark {} beyond the {} mapped pages",
                slot.next_free_page, capacity
            )));
        }

        let manager = PageManager {
            mmap: RwLock::new(mmap),
            page_size,
            capacity,
            fsync_enabled: config.fsync_enabled,
            allocator: Mutex::new(Allocator::new(&slot)),
        };
        manager.load_freelist(slot.freelist_head)?;
        Ok((manager, slot))
    }

    fn load_freelist(&self, head: Option<PageNumber>) -> Result<()> {
        let mut allocator = self.allocator.lock();
        let limit = allocator.next_free_page;
        let last_commit = allocator.last_commit;
        let mut held = vec![];
        let mut next = head;
        while let Some(page_number) = next {
            if page_number >= limit || allocator.freelist_pages.len() as u64 >= limit {
                return Err(Error::Corrupted(format!(
                    "free list page {page_number} out of range"
                )));
            }
            let page = self.get_page(page_number)?;
            let mem = page.memory();
            let count = u32::from_be_bytes(mem[0..4].try_into().unwrap_or_default()) as usize;
            let next_page = u64::from_be_bytes(mem[4..12].try_into().unwrap_or_default());
            if FREELIST_HEADER + count * 8 > self.page_size {
                return Err(Error::Corrupted(format!(
                    "free list page {page_number} claims {count} entries"
                )));
            }
            for entry in mem[FREELIST_HEADER..(FREELIST_HEADER + count * 8)].chunks_exact(8) {
                let raw = u64::from_be_bytes(entry.try_into().unwrap_or_default());
                let free_page = raw & !HELD;
                if free_page == 0 || free_page >= limit {
                    return Err(Error::Corrupted(format!(
                        "free page {free_page} out of range"
                    )));
                }
                if raw & HELD != 0 {
                    held.push(free_page);
                } else {
                    allocator.free.insert(free_page);
                }
            }
            allocator.freelist_pages.push(page_number);
            next = (next_page != 0).then_some(next_page);
        }
        let held_pages = held.len();
        if !held.is_empty() {
            allocator.pending.insert(last_commit, held);
        }
        debug!(
            free_pages = allocator.free.len(),
            held_pages,
            freelist_pages = allocator.freelist_pages.len(),
            "loaded free list"
        );
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Size of the mapped region in bytes.
    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.capacity * self.page_size as u64
    }

    pub(crate) fn stats(&self) -> PageStats {
        let allocator = self.allocator.lock();
        PageStats {
            allocated: allocator.next_free_page,
            free: allocator.free.len() as u64,
            pending: allocator.pending.values().map(|pages| pages.len() as u64).sum(),
        }
    }

    /// The commit before `current`, read from the other header slot.
    pub(crate) fn previous_commit(&self, current: &CommitSlot) -> Option<CommitSlot> {
        storage::read_previous_slot(&self.mmap.read(), current)
    }

    /// Pages no committed root references that may still hold old data: the
    /// free set and pages waiting for readers, in page order.
    pub(crate) fn unreferenced_pages(&self) -> Vec<PageNumber> {
        let allocator = self.allocator.lock();
        let mut pages: Vec<PageNumber> = allocator
            .free
            .iter()
            .chain(allocator.pending.values().flatten())
            .copied()
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Returns a reference to the page with the specified number.
    ///
    /// The page holds a shared lock on the mapping; drop it before allocating
    /// or writing.
    pub(crate) fn get_page(&self, page_number: PageNumber) -> Result<Page<'_>> {
        if page_number == 0 || page_number >= self.capacity {
            return Err(Error::Corrupted(format!(
                "page {page_number} out of bounds"
            )));
        }
        let start = page_number as usize * self.page_size;
        let end = start + self.page_size;
        Ok(Page {
            mem: RwLockReadGuard::map(self.mmap.read(), |m| &m[start..end]),
            page_number,
        })
    }

    fn write_page(&self, page_number: PageNumber, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.page_size);
        let start = page_number as usize * self.page_size;
        let mut mmap = self.mmap.write();
        mmap[start..(start + bytes.len())].copy_from_slice(bytes);
    }

    /// Starts a write transaction: remembers the allocator state for rollback.
    pub(crate) fn begin(&self) {
        let mut allocator = self.allocator.lock();
        allocator.checkpoint = Some(Checkpoint {
            next_free_page: allocator.next_free_page,
            free: allocator.free.clone(),
        });
        allocator.dirty.clear();
        allocator.retired.clear();
    }

    #[cfg(test)]
    pub(crate) fn allocate(&self) -> Result<PageNumber> {
        let mut allocator = self.allocator.lock();
        self.allocate_locked(&mut allocator)
    }

    fn allocate_locked(&self, allocator: &mut Allocator) -> Result<PageNumber> {
        let page_number = match allocator.free.pop_first() {
            Some(page_number) => page_number,
            None => self.bump(allocator)?,
        };
        allocator.dirty.insert(page_number);
        Ok(page_number)
    }

    fn bump(&self, allocator: &mut Allocator) -> Result<PageNumber> {
        if allocator.next_free_page >= self.capacity {
            warn!(
                capacity = self.capacity_bytes(),
                "mapped region exhausted"
            );
            return Err(Error::DatabaseFull {
                capacity: self.capacity_bytes(),
            });
        }
        let page_number = allocator.next_free_page;
        allocator.next_free_page += 1;
        Ok(page_number)
    }

    /// Writes `bytes` as the new version of `page_number` and returns where it
    /// landed. A page allocated by the active transaction is overwritten in
    /// place; a committed page is copied and the old one retired.
    pub(crate) fn write_copy(
        &self,
        page_number: Option<PageNumber>,
        bytes: &[u8],
    ) -> Result<PageNumber> {
        if bytes.len() > self.page_size {
            return Err(Error::RecordTooLarge {
                size: bytes.len(),
                max: self.page_size,
            });
        }
        let target = {
            let mut allocator = self.allocator.lock();
            match page_number {
                Some(page_number) if allocator.dirty.contains(&page_number) => page_number,
                other => {
                    let target = self.allocate_locked(&mut allocator)?;
                    if let Some(old) = other {
                        allocator.retire(old);
                    }
                    target
                }
            }
        };
        self.write_page(target, bytes);
        Ok(target)
    }

    /// Marks a page as no longer referenced by the active transaction.
    pub(crate) fn free(&self, page_number: PageNumber) {
        self.allocator.lock().retire(page_number);
    }

    /// Durably publishes `root` as the state of transaction `txn_id`.
    ///
    /// Data pages are flushed before the header slot is written, and the slot
    /// is flushed before this returns. On error the previous commit is still
    /// the one on disk and the caller must [`rollback`](Self::rollback).
    pub(crate) fn commit(&self, txn_id: u64, root: Option<PageNumber>) -> Result<()> {
        self.commit_with(txn_id, root, |mmap, len| {
            if self.fsync_enabled {
                mmap.flush_range(0, len)
            } else {
                Ok(())
            }
        })
    }

    fn commit_with<F>(&self, txn_id: u64, root: Option<PageNumber>, flush_header: F) -> Result<()>
    where
        F: FnOnce(&MmapMut, usize) -> std::io::Result<()>,
    {
        let mut allocator = self.allocator.lock();

        // The list pages come out of the free set, which holds no page of the
        // last commit, its free list, or anything a snapshot can reach
        let per_page = (self.page_size - FREELIST_HEADER) / 8;
        let mut freelist_pages = vec![];
        loop {
            let listed = allocator.free.len()
                + allocator.pending.values().map(Vec::len).sum::<usize>()
                + allocator.retired.len()
                + allocator.freelist_pages.len();
            if freelist_pages.len() * per_page >= listed {
                break;
            }
            let page_number = match allocator.free.pop_first() {
                Some(page_number) => page_number,
                None => self.bump(&mut allocator)?,
            };
            freelist_pages.push(page_number);
        }

        // After a restart no snapshot exists, so everything but the pages this
        // commit retires is free
        let mut listed: Vec<u64> = allocator
            .free
            .iter()
            .chain(allocator.pending.values().flatten())
            .chain(allocator.freelist_pages.iter())
            .copied()
            .chain(allocator.retired.iter().map(|page_number| page_number | HELD))
            .collect();
        listed.sort_unstable_by_key(|entry| entry & !HELD);

        for (i, chunk) in listed.chunks(per_page).enumerate() {
            let next = freelist_pages.get(i + 1).copied().unwrap_or(0);
            let mut buf = vec![0u8; FREELIST_HEADER + chunk.len() * 8];
            buf[0..4].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
            buf[4..12].copy_from_slice(&next.to_be_bytes());
            for (entry, page_number) in buf[FREELIST_HEADER..].chunks_exact_mut(8).zip(chunk) {
                entry.copy_from_slice(&page_number.to_be_bytes());
            }
            self.write_page(freelist_pages[i], &buf);
        }

        let slot = CommitSlot {
            txn_id,
            root,
            next_free_page: allocator.next_free_page,
            freelist_head: freelist_pages.first().copied(),
        };
        if self.fsync_enabled {
            self.mmap.read().flush()?;
        }
        {
            let mut mmap = self.mmap.write();
            let previous = storage::commit_slot_bytes(&mmap, txn_id);
            storage::write_commit_slot(&mut mmap, slot);
            if let Err(err) = flush_header(&*mmap, self.page_size) {
                // The slot must not win on reopen once the caller is told the commit failed
                storage::restore_commit_slot(&mut mmap, txn_id, &previous);
                warn!(txn_id, error = %err, "header flush failed, restored the previous slot");
                return Err(err.into());
            }
        }

        let retired = std::mem::take(&mut allocator.retired);
        let retired_count = retired.len();
        if !retired.is_empty() {
            allocator.pending.insert(txn_id, retired);
        }
        // The old free list is not part of any snapshot, so it is reusable at once
        let old_freelist = std::mem::replace(&mut allocator.freelist_pages, freelist_pages);
        allocator.free.extend(old_freelist);
        allocator.last_commit = txn_id;
        allocator.dirty.clear();
        allocator.checkpoint = None;
        debug!(
            txn_id,
            retired = retired_count,
            high_water = allocator.next_free_page,
            "published commit slot"
        );
        Ok(())
    }

    /// Discards every page allocated since [`begin`](Self::begin).
    pub(crate) fn rollback(&self) {
        let mut allocator = self.allocator.lock();
        if let Some(checkpoint) = allocator.checkpoint.take() {
            allocator.next_free_page = checkpoint.next_free_page;
            allocator.free = checkpoint.free;
        }
        allocator.dirty.clear();
        allocator.retired.clear();
    }

    /// Makes pages retired by commits newer than every live snapshot reusable.
    ///
    /// A page retired by commit `t` was reachable only from roots older than
    /// `t`, so it can be reused once no snapshot older than `t` is alive. Pages
    /// retired by the last commit are kept until the next one, so the previous
    /// commit stays readable.
    pub(crate) fn release(&self, oldest_reader: Option<u64>) {
        let mut allocator = self.allocator.lock();
        let last_commit = allocator.last_commit;
        let releasable: Vec<u64> = allocator
            .pending
            .keys()
            .copied()
            .take_while(|txn_id| {
                *txn_id < last_commit && oldest_reader.map_or(true, |oldest| oldest >= *txn_id)
            })
            .collect();
        let mut released = 0;
        for txn_id in releasable {
            if let Some(pages) = allocator.pending.remove(&txn_id) {
                released += pages.len();
                allocator.free.extend(pages);
            }
        }
        if released > 0 {
            debug!(released, ?oldest_reader, "recycled retired pages");
        }
    }
}
