//! Bucket directory: an open-addressing hash index over `i64` keys laid
//! out across budget pages.
//!
//! Each 16-byte slot holds `[key: i64 LE][head: u64 LE]`, where `head` is
//! the [`RecordAddress`] of the most recently inserted build record with
//! that key. Older records with the same key are reached through the
//! records' own `next` pointers, so one slot covers any number of
//! duplicates. A slot is empty when `head` is `u64::MAX`.
//!
//! The slot count is a power of two at least twice the number of records,
//! which keeps the load factor at or below one half and linear probing
//! short.

use crate::hash::bucket_hash;
use crate::memory::Page;
use crate::record::{NO_NEXT, RecordAddress};

/// Bytes per slot.
pub(crate) const SLOT_SIZE: usize = 16;

/// Smallest directory, in slots.
const MIN_SLOTS: usize = 16;

pub(crate) struct BucketDirectory {
    pages: Vec<Page>,
    slots_per_page: usize,
    mask: usize,
    keys: usize,
}

impl BucketDirectory {
    /// Number of slots for a partition of `records` build records.
    pub fn slot_count(records: u64) -> usize {
        usize::try_from(records)
            .unwrap_or(usize::MAX / 4)
            .saturating_mul(2)
            .max(MIN_SLOTS)
            .next_power_of_two()
    }

    /// Pages a directory over `records` build records occupies.
    pub fn pages_needed(records: u64, page_size: usize) -> usize {
        if records == 0 {
            return 0;
        }
        (Self::slot_count(records) * SLOT_SIZE).div_ceil(page_size)
    }

    /// Lays out an empty directory for `records` records over `pages`.
    ///
    /// `pages` must hold at least [`pages_needed`](Self::pages_needed)
    /// pages, all of the same size.
    pub fn new(mut pages: Vec<Page>, records: u64) -> Self {
        for page in &mut pages {
            page.as_mut_slice().fill(0xFF);
        }
        let slots_per_page = pages.first().map_or(0, |p| p.size() / SLOT_SIZE);
        Self {
            pages,
            slots_per_page,
            mask: Self::slot_count(records) - 1,
            keys: 0,
        }
    }

    /// Distinct keys in the directory.
    pub fn keys(&self) -> usize {
        self.keys
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Points `key` at `addr` and returns the previous head for that key,
    /// [`NO_NEXT`] if the key is new.
    pub fn insert(&mut self, key: i64, addr: RecordAddress) -> u64 {
        let mut slot = bucket_hash(key) as usize & self.mask;
        loop {
            let (slot_key, head) = self.read_slot(slot);
            if head == NO_NEXT {
                self.write_slot(slot, key, addr.0);
                self.keys += 1;
                return NO_NEXT;
            }
            if slot_key == key {
                self.write_slot(slot, key, addr.0);
                return head;
            }
            slot = (slot + 1) & self.mask;
        }
    }

    /// Head of the chain of records with `key`.
    pub fn lookup(&self, key: i64) -> Option<RecordAddress> {
        let mut slot = bucket_hash(key) as usize & self.mask;
        loop {
            let (slot_key, head) = self.read_slot(slot);
            if head == NO_NEXT {
                return None;
            }
            if slot_key == key {
                return Some(RecordAddress(head));
            }
            slot = (slot + 1) & self.mask;
        }
    }

    pub fn into_pages(self) -> Vec<Page> {
        self.pages
    }

    #[inline]
    fn locate(&self, slot: usize) -> (usize, usize) {
        (slot / self.slots_per_page, (slot % self.slots_per_page) * SLOT_SIZE)
    }

    fn read_slot(&self, slot: usize) -> (i64, u64) {
        let (page, off) = self.locate(slot);
        let bytes = &self.pages[page].as_slice()[off..off + SLOT_SIZE];
        let mut key = [0u8; 8];
        let mut head = [0u8; 8];
        key.copy_from_slice(&bytes[..8]);
        head.copy_from_slice(&bytes[8..]);
        (i64::from_le_bytes(key), u64::from_le_bytes(head))
    }

    fn write_slot(&mut self, slot: usize, key: i64, head: u64) {
        let (page, off) = self.locate(slot);
        let bytes = &mut self.pages[page].as_mut_slice()[off..off + SLOT_SIZE];
        bytes[..8].copy_from_slice(&key.to_le_bytes());
        bytes[8..].copy_from_slice(&head.to_le_bytes());
    }
}
