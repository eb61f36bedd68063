//! Process-local cache of decrypted internal keys.
//!
//! Key material lives in an arena of OS pages locked into RAM, so that it is
//! never written to swap. The arena grows one page at a time and entries
//! are never evicted; pages are wiped before they are returned to the
//! allocator.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;

use nix::sys::mman::{mlock, munlock};
use postgres_ffi::RelFileNode;
use tracing::warn;
use zeroize::Zeroize;

use crate::encryption::{InternalKey, BASE_IV_LEN, INTERNAL_KEY_LEN};
use crate::keymap::KeyType;

const SLOT_SIZE: usize = INTERNAL_KEY_LEN + BASE_IV_LEN;
const FALLBACK_PAGE_SIZE: usize = 4096;

fn os_page_size() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// One page-aligned, page-sized allocation, mlocked while alive.
struct LockedPage {
    ptr: NonNull<u8>,
    layout: Layout,
    locked: bool,
}

// The page is exclusively owned and only reachable through the arena.
unsafe impl Send for LockedPage {}

impl LockedPage {
    fn new(page_size: usize) -> Option<LockedPage> {
        let layout = Layout::from_size_align(page_size, page_size).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        // SAFETY: ptr points to page_size bytes we own.
        let locked = match unsafe { mlock(ptr.as_ptr() as *const c_void, page_size) } {
            Ok(()) => true,
            Err(e) => {
                warn!("could not mlock internal key cache page: {e}");
                false
            }
        };
        Some(LockedPage {
            ptr,
            layout,
            locked,
        })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation is live and sized by layout.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        self.bytes_mut().zeroize();
        if self.locked {
            // SAFETY: same range that was locked in new().
            let _ = unsafe { munlock(self.ptr.as_ptr() as *const c_void, self.layout.size()) };
        }
        // SAFETY: allocated in new() with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    page: usize,
    slot: usize,
}

/// Bump allocator of fixed-size key slots over locked pages.
pub struct LockedArena {
    page_size: usize,
    pages: Vec<LockedPage>,
    used_in_last: usize,
}

impl LockedArena {
    pub fn new() -> LockedArena {
        LockedArena {
            page_size: os_page_size().max(SLOT_SIZE),
            pages: Vec::new(),
            used_in_last: 0,
        }
    }

    fn slots_per_page(&self) -> usize {
        self.page_size / SLOT_SIZE
    }

    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    fn store(&mut self, key: &InternalKey) -> Option<SlotRef> {
        if self.pages.is_empty() || self.used_in_last == self.slots_per_page() {
            self.pages.push(LockedPage::new(self.page_size)?);
            self.used_in_last = 0;
        }
        let slot = SlotRef {
            page: self.pages.len() - 1,
            slot: self.used_in_last,
        };
        self.used_in_last += 1;
        self.write(slot, key);
        Some(slot)
    }

    fn write(&mut self, slot: SlotRef, key: &InternalKey) {
        let off = slot.slot * SLOT_SIZE;
        let bytes = &mut self.pages[slot.page].bytes_mut()[off..off + SLOT_SIZE];
        bytes[..INTERNAL_KEY_LEN].copy_from_slice(&key.key);
        bytes[INTERNAL_KEY_LEN..].copy_from_slice(&key.base_iv);
    }

    fn read(&self, slot: SlotRef) -> InternalKey {
        let off = slot.slot * SLOT_SIZE;
        let bytes = &self.pages[slot.page].bytes()[off..off + SLOT_SIZE];
        let mut key = InternalKey {
            key: [0u8; INTERNAL_KEY_LEN],
            base_iv: [0u8; BASE_IV_LEN],
        };
        key.key.copy_from_slice(&bytes[..INTERNAL_KEY_LEN]);
        key.base_iv.copy_from_slice(&bytes[INTERNAL_KEY_LEN..]);
        key
    }
}

impl Default for LockedArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrypted relation keys by locator and key type.
#[derive(Default)]
pub struct KeyCache {
    arena: LockedArena,
    slots: HashMap<(RelFileNode, KeyType), SlotRef>,
}

impl KeyCache {
    pub fn new() -> KeyCache {
        KeyCache::default()
    }

    pub fn get(&self, locator: &RelFileNode, key_type: KeyType) -> Option<InternalKey> {
        self.slots
            .get(&(*locator, key_type))
            .map(|slot| self.arena.read(*slot))
    }

    /// Insert or overwrite. If the arena cannot grow the key is simply not
    /// cached.
    pub fn put(&mut self, locator: RelFileNode, key_type: KeyType, key: &InternalKey) {
        match self.slots.get(&(locator, key_type)) {
            Some(slot) => self.arena.write(*slot, key),
            None => {
                if let Some(slot) = self.arena.store(key) {
                    self.slots.insert((locator, key_type), slot);
                }
            }
        }
    }

    /// Forget a key. Its slot stays allocated but is wiped.
    pub fn remove(&mut self, locator: &RelFileNode, key_type: KeyType) {
        if let Some(slot) = self.slots.remove(&(*locator, key_type)) {
            self.arena.write(
                slot,
                &InternalKey {
                    key: [0u8; INTERNAL_KEY_LEN],
                    base_iv: [0u8; BASE_IV_LEN],
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn arena_pages(&self) -> usize {
        self.arena.pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(rel: u32) -> RelFileNode {
        RelFileNode {
            spcnode: 1663,
            dbnode: 5,
            relnode: rel,
        }
    }

    #[test]
    fn cache_grows_page_by_page() {
        let mut cache = KeyCache::new();
        let per_page = cache.arena.slots_per_page();
        let keys: Vec<InternalKey> = (0..per_page + 1).map(|_| InternalKey::generate()).collect();

        for (i, key) in keys.iter().enumerate() {
            cache.put(locator(i as u32), KeyType::HeapBasic, key);
        }
        assert_eq!(cache.arena_pages(), 2);
        assert_eq!(cache.len(), per_page + 1);

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(cache.get(&locator(i as u32), KeyType::HeapBasic).as_ref(), Some(key));
        }
        assert!(cache.get(&locator(0), KeyType::Smgr).is_none());
    }

    #[test]
    fn overwrite_and_remove() {
        let mut cache = KeyCache::new();
        let a = InternalKey::generate();
        let b = InternalKey::generate();
        cache.put(locator(1), KeyType::Smgr, &a);
        cache.put(locator(1), KeyType::Smgr, &b);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&locator(1), KeyType::Smgr), Some(b));

        cache.remove(&locator(1), KeyType::Smgr);
        assert!(cache.is_empty());
        assert_eq!(cache.arena_pages(), 1);
    }
}
