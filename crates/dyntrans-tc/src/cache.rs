//! The translation cache (TC), `spec.md` §3, §4.4.
//!
//! The original lays the TC out as one contiguous byte arena: a hash-table
//! header of `u32` offsets followed by a bump-allocated region of
//! [`PhysPage`] records, each reached only via its hash chain. Resetting the
//! TC on exhaustion is just "zero the hash heads, rewind the bump offset";
//! the live records become unreachable garbage. We keep that *shape* but
//! replace the byte arena with a `Vec<PhysPage<Ctx>>` arena addressed by
//! [`PageId`], which gives the same "reset = truncate + clear hash table"
//! cost profile without pointer arithmetic into a raw byte slab.

use tracing::debug;

use crate::ic::{Handler, InstrCall, Operand};
use crate::page::{PageFlags, PageId, PhysPage};

pub struct TcConfig {
    /// Number of ordinary IC slots per page (`IC_ENTRIES_PER_PAGE`).
    pub ic_entries_per_page: usize,
    /// 1 for architectures without delay slots (`end_of_page` only), 2 for
    /// those with them (`end_of_page` + `end_of_page2`).
    pub sentinel_slots: usize,
    /// log2 of the hash-table size; table has `1 << hash_bits` slots.
    pub hash_bits: u32,
    /// Upper bound on the number of PPTRs the arena holds before a full
    /// reset is forced (`spec.md` §4.4 "Size threshold").
    pub max_pages: usize,
}

impl Default for TcConfig {
    fn default() -> Self {
        Self { ic_entries_per_page: 1024, sentinel_slots: 1, hash_bits: 12, max_pages: 4096 }
    }
}

pub struct TranslationCache<Ctx> {
    config: TcConfig,
    hash_table: Vec<Option<PageId>>,
    pages: Vec<PhysPage<Ctx>>,
    to_be_translated: Handler<Ctx>,
    end_of_page: Handler<Ctx>,
    end_of_page2: Option<Handler<Ctx>>,
    pub resets: u64,
}

impl<Ctx> TranslationCache<Ctx> {
    pub fn new(
        config: TcConfig,
        to_be_translated: Handler<Ctx>,
        end_of_page: Handler<Ctx>,
        end_of_page2: Option<Handler<Ctx>>,
    ) -> Self {
        assert!(config.sentinel_slots == 1 || config.sentinel_slots == 2);
        assert_eq!(end_of_page2.is_some(), config.sentinel_slots == 2);
        let table_size = 1usize << config.hash_bits;
        Self {
            hash_table: vec![None; table_size],
            pages: Vec::with_capacity(config.max_pages.min(1024)),
            to_be_translated,
            end_of_page,
            end_of_page2,
            config,
            resets: 0,
        }
    }

    pub fn ic_entries_per_page(&self) -> usize {
        self.config.ic_entries_per_page
    }

    pub fn sentinel_slots(&self) -> usize {
        self.config.sentinel_slots
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn table_index(&self, pagenr: u64) -> usize {
        (pagenr as usize) & (self.hash_table.len() - 1)
    }

    /// `cpu_create_or_reset_tc`: zeroes the hash-table header and rewinds
    /// the arena. Live `PageId`s handed out before the reset become
    /// dangling in the sense that they no longer appear in any hash chain;
    /// callers must re-resolve via [`Self::lookup_or_allocate`] after a
    /// reset (the dispatch loop guarantees this, `spec.md` §4.4/§9).
    pub fn reset(&mut self) {
        for slot in &mut self.hash_table {
            *slot = None;
        }
        self.pages.clear();
        self.resets += 1;
        debug!(resets = self.resets, "translation cache reset");
    }

    pub fn should_reset(&self) -> bool {
        self.pages.len() >= self.config.max_pages
    }

    fn allocate_default_page(&mut self, physaddr: u64) -> PageId {
        let total_slots = self.config.ic_entries_per_page + self.config.sentinel_slots;
        let mut ics = Vec::with_capacity(total_slots);
        for _ in 0..self.config.ic_entries_per_page {
            ics.push(InstrCall::new(self.to_be_translated, [Operand::None; 3]));
        }
        ics.push(InstrCall::new(self.end_of_page, [Operand::None; 3]));
        if let Some(eop2) = self.end_of_page2 {
            ics.push(InstrCall::new(eop2, [Operand::None; 3]));
        }
        let id = PageId(self.pages.len() as u32);
        self.pages.push(PhysPage { physaddr, flags: PageFlags::empty(), ics: ics.into_boxed_slice(), next: None });
        id
    }

    /// `XXX_pc_to_pointers` steps 3–5 / `spec.md` §4.5: walk the hash chain
    /// for `physaddr`'s page; allocate and chain a fresh default page if
    /// none exists yet. `pagenr` is the caller's `physaddr >> page_shift`.
    pub fn lookup_or_allocate(&mut self, physaddr: u64, pagenr: u64) -> PageId {
        if self.should_reset() {
            self.reset();
        }
        let index = self.table_index(pagenr);
        let mut cursor = self.hash_table[index];
        while let Some(id) = cursor {
            if self.pages[id.0 as usize].physaddr == physaddr {
                return id;
            }
            cursor = self.pages[id.0 as usize].next;
        }
        debug!(physaddr, pagenr, table_index = index, "allocating new translation page");
        let id = self.allocate_default_page(physaddr);
        self.pages[id.0 as usize].next = self.hash_table[index];
        self.hash_table[index] = Some(id);
        id
    }

    pub fn lookup(&self, physaddr: u64, pagenr: u64) -> Option<PageId> {
        let index = self.table_index(pagenr);
        let mut cursor = self.hash_table[index];
        while let Some(id) = cursor {
            if self.pages[id.0 as usize].physaddr == physaddr {
                return Some(id);
            }
            cursor = self.pages[id.0 as usize].next;
        }
        None
    }

    /// Unlinks the PPTR for `physaddr` (if live) from its hash chain
    /// without freeing the arena slot. This is the "drop the PPTR" code-
    /// invalidation strategy `spec.md` §4.9 describes as the simpler of
    /// the two acceptable approaches. Returns `true` if a page was found
    /// and unlinked.
    pub fn unlink(&mut self, physaddr: u64, pagenr: u64) -> bool {
        let index = self.table_index(pagenr);
        let mut cursor = self.hash_table[index];
        let mut prev: Option<PageId> = None;
        while let Some(id) = cursor {
            let page = &self.pages[id.0 as usize];
            if page.physaddr == physaddr {
                let next = page.next;
                match prev {
                    Some(p) => self.pages[p.0 as usize].next = next,
                    None => self.hash_table[index] = next,
                }
                debug!(physaddr, pagenr, "invalidated code translation");
                return true;
            }
            prev = Some(id);
            cursor = page.next;
        }
        false
    }

    pub fn page(&self, id: PageId) -> &PhysPage<Ctx> {
        &self.pages[id.0 as usize]
    }

    pub fn page_mut(&mut self, id: PageId) -> &mut PhysPage<Ctx> {
        &mut self.pages[id.0 as usize]
    }

    /// Resets every IC slot of a page back to `to_be_translated`
    /// (`spec.md` §4.6, single-step flushing a page that had
    /// `COMBINATIONS`) without unlinking the page from the cache. This is
    /// the "kinder" invalidation alternative `spec.md` §4.9 also permits.
    pub fn flush_page_to_untranslated(&mut self, id: PageId) {
        let page = &mut self.pages[id.0 as usize];
        for slot in page.ics[..self.config.ic_entries_per_page].iter_mut() {
            *slot = InstrCall::new(self.to_be_translated, [Operand::None; 3]);
        }
        page.flags &= !(PageFlags::COMBINATIONS | PageFlags::TRANSLATIONS);
    }
}
