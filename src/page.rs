//! Per-page metadata arena.
//!
//! The source links pages into lists with raw predecessor/successor pointers.
//! This crate generalizes that into a stable-id arena (`Vec<PageRecord>`
//! indexed by `PageId`) plus a `current_list` tag on each record, so that
//! list membership can be asserted without chasing pointers (§9 design note).

use std::collections::HashMap;

use crate::addr::{PAddr, VAddr};

/// Stable index into the page arena. Never reused while the process runs
/// (record destruction is deferred per §4.1: frames go back to a free pool,
/// the record itself stays alive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Base,
    Huge,
}

/// Which of the four hot/cold FIFOs (or neither, while free) currently holds
/// this page. Index order is also the lock-acquisition order used whenever an
/// operation must hold two list locks at once (§9: "fixed global order").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTag {
    DramHot = 0,
    DramCold = 1,
    NvmHot = 2,
    NvmCold = 3,
}

impl ListTag {
    pub const ALL: [ListTag; 4] = [
        ListTag::DramHot,
        ListTag::DramCold,
        ListTag::NvmHot,
        ListTag::NvmCold,
    ];

    pub fn for_tier(in_dram: bool, hot: bool) -> ListTag {
        match (in_dram, hot) {
            (true, true) => ListTag::DramHot,
            (true, false) => ListTag::DramCold,
            (false, true) => ListTag::NvmHot,
            (false, false) => ListTag::NvmCold,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessCounters {
    pub reads: u64,
    pub writes: u64,
}

impl AccessCounters {
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: PageId,
    pub vaddr: VAddr,
    pub phy_addr: PAddr,
    pub in_dram: bool,
    pub page_type: PageType,
    pub present: bool,
    pub hot: bool,
    pub migrating: bool,
    /// Mirrors the source's `ring_present`: true while queued on policy A's
    /// `hot_ring`/`cold_ring` awaiting the policy thread's drain.
    pub ring_present: bool,
    pub accesses: AccessCounters,
    /// Policy B's unified counter (`naccesses`). Unused by policy A.
    pub naccesses: u64,
    pub local_clock: u64,
    pub local_epoch: u64,
    pub current_list: Option<ListTag>,
}

impl PageRecord {
    fn new_free(id: PageId, phy_addr: PAddr, in_dram: bool) -> PageRecord {
        PageRecord {
            id,
            vaddr: VAddr(0),
            phy_addr,
            in_dram,
            page_type: PageType::Base,
            present: false,
            hot: false,
            migrating: false,
            ring_present: false,
            accesses: AccessCounters::default(),
            naccesses: 0,
            local_clock: 0,
            local_epoch: 0,
            current_list: None,
        }
    }
}

/// The arena of every page record ever observed, plus the vaddr -> id index
/// used to resolve access samples (§4.2/§4.3 "locate the page by
/// base-page-aligned vaddr"). Guarded by the allocator mutex alongside the
/// tier free pools (§4.1 "a single mutex guards both free pools and the
/// active-page map").
pub struct PageArena {
    records: Vec<PageRecord>,
    by_vaddr: HashMap<VAddr, PageId>,
}

impl PageArena {
    pub fn new() -> PageArena {
        PageArena {
            records: Vec::new(),
            by_vaddr: HashMap::new(),
        }
    }

    /// Allocates a fresh free-pool record backed by `phy_addr`. Used once per
    /// physical frame at pool construction time.
    pub fn new_free_record(&mut self, phy_addr: PAddr, in_dram: bool) -> PageId {
        let id = PageId(self.records.len());
        self.records.push(PageRecord::new_free(id, phy_addr, in_dram));
        id
    }

    pub fn get(&self, id: PageId) -> &PageRecord {
        &self.records[id.0]
    }

    pub fn get_mut(&mut self, id: PageId) -> &mut PageRecord {
        &mut self.records[id.0]
    }

    pub fn lookup_vaddr(&self, vaddr: VAddr) -> Option<PageId> {
        self.by_vaddr.get(&vaddr.page_base()).copied()
    }

    /// Binds a previously-free record to a faulting vaddr, marking it present.
    pub fn bind_vaddr(&mut self, id: PageId, vaddr: VAddr) {
        let base = vaddr.page_base();
        let rec = self.get_mut(id);
        rec.vaddr = base;
        rec.present = true;
        self.by_vaddr.insert(base, id);
    }

    /// Clears the vaddr binding of a record that is being returned to a free
    /// pool (the destination of a migration swap, per §4.5 step 5).
    pub fn unbind_vaddr(&mut self, id: PageId) {
        let rec = self.get_mut(id);
        if !rec.vaddr.is_null() {
            self.by_vaddr.remove(&rec.vaddr);
        }
        rec.vaddr = VAddr(0);
        rec.present = false;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl Default for PageArena {
    fn default() -> Self {
        Self::new()
    }
}
