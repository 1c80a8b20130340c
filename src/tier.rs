//! Tier free-frame allocator (§4.1).
//!
//! A single mutex guards both free pools and the page arena, matching the
//! spec's "a single mutex guards both free pools and the active-page map".
//! Destruction is deferred: frames never leave the arena, they just move
//! between a free-pool deque and a hot/cold list.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::warn;

use crate::addr::{PAddr, VAddr};
use crate::config::{MigrationConfig, PreferredNode};
use crate::page::{PageArena, PageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Dram,
    Nvm,
}

impl Tier {
    pub fn opposite(self) -> Tier {
        match self {
            Tier::Dram => Tier::Nvm,
            Tier::Nvm => Tier::Dram,
        }
    }

    pub fn is_dram(self) -> bool {
        matches!(self, Tier::Dram)
    }
}

struct Inner {
    arena: PageArena,
    dram_free: VecDeque<PageId>,
    nvm_free: VecDeque<PageId>,
    dram_reserve: u64,
}

pub struct TierAllocator {
    inner: Mutex<Inner>,
}

impl TierAllocator {
    /// Builds the two free pools up-front: `dram_pages`/`nvm_pages` frames,
    /// physical addresses assigned contiguously with DRAM occupying the low
    /// range (so `phys_addr < dram_size` selects DRAM, per §6).
    pub fn new(config: &MigrationConfig) -> TierAllocator {
        let mut arena = PageArena::new();
        let mut dram_free = VecDeque::with_capacity(config.dram_pages as usize);
        let mut nvm_free = VecDeque::with_capacity(config.nvm_pages as usize);

        for i in 0..config.dram_pages {
            let phy = PAddr(i * crate::addr::PAGE_SIZE);
            let id = arena.new_free_record(phy, true);
            dram_free.push_back(id);
        }
        let nvm_base = config.dram_pages * crate::addr::PAGE_SIZE;
        for i in 0..config.nvm_pages {
            let phy = PAddr(nvm_base + i * crate::addr::PAGE_SIZE);
            let id = arena.new_free_record(phy, false);
            nvm_free.push_back(id);
        }

        TierAllocator {
            inner: Mutex::new(Inner {
                arena,
                dram_free,
                nvm_free,
                dram_reserve: config.dram_reserve_pages(),
            }),
        }
    }

    fn free_deque<'a>(inner: &'a mut Inner, tier: Tier) -> &'a mut VecDeque<PageId> {
        match tier {
            Tier::Dram => &mut inner.dram_free,
            Tier::Nvm => &mut inner.nvm_free,
        }
    }

    /// `allocate(size, vaddr, is_pagetable)` (§4.1). `is_pagetable` is
    /// accepted for interface parity with the source but does not change
    /// placement here: page-table frame accounting is external (§1).
    pub fn allocate(
        &self,
        vaddr: VAddr,
        preferred: PreferredNode,
        tiered_memory: bool,
    ) -> (PageId, PAddr) {
        let mut inner = self.inner.lock().unwrap();

        let want_dram = if !tiered_memory {
            true
        } else {
            match preferred {
                PreferredNode::Dram => inner.dram_free.len() as u64 > inner.dram_reserve,
                PreferredNode::Nvm => false,
            }
        };

        let id = if want_dram {
            inner
                .dram_free
                .pop_front()
                .or_else(|| inner.nvm_free.pop_front())
        } else {
            inner.nvm_free.pop_front().or_else(|| {
                if inner.dram_free.len() as u64 > inner.dram_reserve {
                    inner.dram_free.pop_front()
                } else {
                    None
                }
            })
        };

        let id = id.unwrap_or_else(|| {
            panic!("tier allocator exhausted: no free frame in DRAM or NVM for {vaddr}")
        });

        inner.arena.bind_vaddr(id, vaddr);
        let phy = inner.arena.get(id).phy_addr;
        (id, phy)
    }

    /// `get_free_page(tier)` (§4.1): used by the migration executor to get a
    /// replacement frame in the opposite tier. Never blocks; returns `None`
    /// on exhaustion (allocator-exhaustion failure case, §7).
    pub fn get_free_page(&self, tier: Tier) -> Option<PageId> {
        let mut inner = self.inner.lock().unwrap();
        let popped = Self::free_deque(&mut inner, tier).pop_front();
        if popped.is_none() {
            warn!("tier allocator: no free frame available in {:?}", tier);
        }
        popped
    }

    /// Returns `id` to `tier`'s free pool. Per §4.1, after a migration swap
    /// the executor deallocates the *destination* record back to the
    /// *source* tier, because the struct now holds the old physical address.
    pub fn deallocate(&self, id: PageId, tier: Tier) {
        let mut inner = self.inner.lock().unwrap();
        inner.arena.unbind_vaddr(id);
        {
            let rec = inner.arena.get_mut(id);
            rec.migrating = false;
            rec.hot = false;
            rec.accesses = Default::default();
            rec.naccesses = 0;
        }
        Self::free_deque(&mut inner, tier).push_back(id);
    }

    pub fn with_arena<R>(&self, f: impl FnOnce(&PageArena) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(&inner.arena)
    }

    pub fn with_arena_mut<R>(&self, f: impl FnOnce(&mut PageArena) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.arena)
    }

    pub fn free_count(&self, tier: Tier) -> usize {
        let inner = self.inner.lock().unwrap();
        match tier {
            Tier::Dram => inner.dram_free.len(),
            Tier::Nvm => inner.nvm_free.len(),
        }
    }
}
