//! Migration executor: `move_pages` (§4.5).
//!
//! Batches page moves by TLB-shootdown capacity N, coordinating
//! invalidate -> shootdown -> frame swap -> deferred commit.
//!
//! Ordering note (resolves an ambiguity the distilled spec leaves implicit,
//! see DESIGN.md): the metadata swap and the DMA-commit map insert both
//! happen *before* the blocking shootdown call, not after it as a literal
//! top-to-bottom reading of §4.5 would suggest. Neither changes anything a
//! page-table walk can observe — the PTE stays MOVING until
//! `dma_migrate` runs — so this preserves the §4.5/§9 ordering invariant
//! ("swap happens-before DMA-commit PTE update") while also guaranteeing the
//! DMA-commit entry exists by the time the shootdown protocol's own
//! completion handler looks it up.

use std::sync::Arc;

use log::{error, warn};
use rand::Rng;

use crate::addr::{PAddr, VAddr};
use crate::clock::SimClock;
use crate::dma::DmaCommitMap;
use crate::page::PageId;
use crate::pagetable::PageTable;
use crate::shootdown::ShootdownCoordinator;
use crate::tier::{Tier, TierAllocator};

pub struct MigrationExecutor {
    tier: Arc<TierAllocator>,
    page_table: Arc<dyn PageTable>,
    shootdown: Arc<ShootdownCoordinator>,
    dma_map: Arc<DmaCommitMap>,
    clock: Arc<dyn SimClock>,
    tlb_shootdown_size: usize,
    num_cores: usize,
    app_id: u32,
}

impl MigrationExecutor {
    pub fn new(
        tier: Arc<TierAllocator>,
        page_table: Arc<dyn PageTable>,
        shootdown: Arc<ShootdownCoordinator>,
        dma_map: Arc<DmaCommitMap>,
        clock: Arc<dyn SimClock>,
        tlb_shootdown_size: usize,
        num_cores: usize,
        app_id: u32,
    ) -> MigrationExecutor {
        MigrationExecutor {
            tier,
            page_table,
            shootdown,
            dma_map,
            clock,
            tlb_shootdown_size: tlb_shootdown_size.max(1),
            num_cores,
            app_id,
        }
    }

    /// `move_pages(src, dir)`: `src[i]` migrates up (to DRAM) iff `dir[i]`.
    /// Returns whether at least one page in the whole call actually moved;
    /// partial per-batch failures are tolerated.
    pub fn move_pages(&self, sources: &[(PageId, bool)]) -> bool {
        let mut any_moved = false;
        for batch in sources.chunks(self.tlb_shootdown_size) {
            if self.move_batch(batch) {
                any_moved = true;
            }
        }
        any_moved
    }

    fn move_batch(&self, batch: &[(PageId, bool)]) -> bool {
        let mut vaddrs = Vec::with_capacity(self.tlb_shootdown_size);
        let mut new_paddrs = Vec::with_capacity(self.tlb_shootdown_size);
        let mut pairs: Vec<(PageId, PageId, bool)> = Vec::with_capacity(batch.len());
        let mut failed: Vec<PageId> = Vec::new();

        for &(src_id, migrate_up) in batch {
            let target_tier = if migrate_up { Tier::Dram } else { Tier::Nvm };
            match self.tier.get_free_page(target_tier) {
                Some(dst_id) => {
                    let (src_vaddr, dst_paddr) = self
                        .tier
                        .with_arena(|arena| (arena.get(src_id).vaddr, arena.get(dst_id).phy_addr));
                    vaddrs.push(src_vaddr);
                    new_paddrs.push(dst_paddr);
                    pairs.push((src_id, dst_id, migrate_up));
                }
                None => {
                    warn!("migration executor: allocator exhausted for page {:?}", src_id);
                    failed.push(src_id);
                }
            }
        }

        if pairs.is_empty() {
            self.clear_migrating(&failed);
            return false;
        }

        // Zero-fill the unused tail of a partially-filled batch (§4.5 step 2).
        while vaddrs.len() < self.tlb_shootdown_size {
            vaddrs.push(VAddr(0));
            new_paddrs.push(PAddr(0));
        }

        // Invalidate: flip every valid slot's PTE to MOVING.
        for &(src_id, _, _) in &pairs {
            let vaddr = self.tier.with_arena(|arena| arena.get(src_id).vaddr);
            if let Err(e) = self.page_table.page_moving(vaddr) {
                error!("{e}");
                panic!("{e}");
            }
        }

        let batch_id = vaddrs[0];

        // Swap metadata and record the pending commit before the blocking
        // shootdown call (see module docs for why).
        self.tier.with_arena_mut(|arena| {
            for &(src_id, dst_id, migrate_up) in &pairs {
                let src_phy = arena.get(src_id).phy_addr;
                let dst_phy = arena.get(dst_id).phy_addr;
                arena.get_mut(src_id).phy_addr = dst_phy;
                arena.get_mut(src_id).in_dram = migrate_up;
                arena.unbind_vaddr(dst_id);
                arena.get_mut(dst_id).phy_addr = src_phy;
            }
        });
        self.dma_map.insert(batch_id, vaddrs.clone(), new_paddrs);

        // Return each destination record (now carrying the old phys addr) to
        // the *source* tier's free pool (§4.5 step 5).
        for &(_, dst_id, migrate_up) in &pairs {
            let source_tier = if migrate_up { Tier::Nvm } else { Tier::Dram };
            self.tier.deallocate(dst_id, source_tier);
        }

        let initiator_core = rand::thread_rng().gen_range(0..self.num_cores);
        self.shootdown
            .enqueue_tlb_shootdown(initiator_core, self.app_id, vaddrs);

        let succeeded: Vec<PageId> = pairs.iter().map(|&(src, _, _)| src).collect();
        self.clear_migrating(&succeeded);
        self.clear_migrating(&failed);

        let _ = self.clock.now(initiator_core);
        true
    }

    fn clear_migrating(&self, ids: &[PageId]) {
        if ids.is_empty() {
            return;
        }
        self.tier.with_arena_mut(|arena| {
            for &id in ids {
                arena.get_mut(id).migrating = false;
            }
        });
    }
}
