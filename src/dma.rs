//! Deferred DMA-commit map (§3, §4.7).
//!
//! "DMA commit" is a scheduled PTE write, not a real DMA (§9): an entry here
//! just remembers which vaddrs/new physical addresses are waiting for their
//! permission to flip back to READ_WRITE once every core has acknowledged
//! the shootdown that preceded it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addr::{PAddr, VAddr};
use crate::pagetable::PageTable;

struct DmaCommitEntry {
    vaddrs: Vec<VAddr>,
    new_paddrs: Vec<PAddr>,
}

pub struct DmaCommitMap {
    inner: Mutex<HashMap<VAddr, DmaCommitEntry>>,
}

impl DmaCommitMap {
    pub fn new() -> DmaCommitMap {
        DmaCommitMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a pending batch keyed by `id == vaddrs[0]`. Unused tail slots
    /// in a partially-filled shootdown batch are zero-filled (§4.5 step 2)
    /// and skipped at commit time.
    pub fn insert(&self, id: VAddr, vaddrs: Vec<VAddr>, new_paddrs: Vec<PAddr>) {
        debug_assert_eq!(vaddrs.len(), new_paddrs.len());
        self.inner
            .lock()
            .unwrap()
            .insert(id, DmaCommitEntry { vaddrs, new_paddrs });
    }

    /// `dma_migrate(id, finish_time)` (§4.7). Idempotent: a missing entry
    /// (already committed, or never recorded) is a silent no-op.
    pub fn commit(&self, id: VAddr, finish_time: u64, page_table: &dyn PageTable) {
        let entry = self.inner.lock().unwrap().remove(&id);
        let Some(entry) = entry else {
            return;
        };
        for (vaddr, paddr) in entry.vaddrs.iter().zip(entry.new_paddrs.iter()) {
            if vaddr.is_null() {
                continue;
            }
            page_table.dma_move_page(*vaddr, *paddr, finish_time);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for DmaCommitMap {
    fn default() -> Self {
        Self::new()
    }
}
