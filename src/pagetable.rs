//! The page-table collaborator (§6). The structure itself is external to
//! this crate; we only depend on the operations below, modeled as a trait so
//! the embedder's real radix/hashed page table can be plugged in. A
//! `tests`-only in-memory implementation backs the integration scenarios.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addr::{PAddr, VAddr};
use crate::error::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadWrite,
    /// Set by `page_moving`; cleared by `dma_move_page`. A walk that observes
    /// this permission must back off (§4.5 step 3).
    Moving,
}

#[derive(Debug, Clone, Copy)]
pub struct PteWalk {
    pub ppn: Option<PAddr>,
    pub fault_reason: Option<WalkFault>,
    /// Set while a commit is still pending; a walk reaching this must stall
    /// until `dma_finish_time` (§4.7).
    pub dma_finish_time: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFault {
    NotPresent,
}

/// The page-table operations this crate consumes. All methods must be safe
/// to call from any core's thread concurrently.
pub trait PageTable: Send + Sync {
    fn walk(&self, vaddr: VAddr) -> PteWalk;
    fn check_page_exist(&self, vaddr: VAddr) -> bool;

    /// Sets the PTE permission to MOVING. Returns
    /// [`MigrationError::PteAlreadyMoving`] if the entry was already MOVING —
    /// the executor must never observe this (§4.5); callers treat it as
    /// fatal.
    fn page_moving(&self, vaddr: VAddr) -> Result<(), MigrationError>;

    /// Commits the new mapping, restores READ_WRITE, and stores
    /// `finish_time` as the entry's `DMA_finish` stamp. `new_paddr` is
    /// carried here from the DMA-commit map (§3) since that is the only
    /// place the new physical address is recorded after the metadata swap.
    fn dma_move_page(&self, vaddr: VAddr, new_paddr: PAddr, finish_time: u64);

    /// Runs `f` while holding the page table's own per-bucket lock for
    /// `vaddr`. Exposed for interface parity with §6; the core's own
    /// operations above are already individually thread-safe and do not need
    /// to take this lock themselves.
    fn with_page_lock(&self, vaddr: VAddr, f: &mut dyn FnMut());
}

struct Pte {
    ppn: PAddr,
    permission: Permission,
    dma_finish: Option<u64>,
}

/// In-memory page table used only by this crate's own tests.
pub struct TestPageTable {
    entries: Mutex<HashMap<VAddr, Pte>>,
}

impl TestPageTable {
    pub fn new() -> TestPageTable {
        TestPageTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, vaddr: VAddr, ppn: PAddr) {
        self.entries.lock().unwrap().insert(
            vaddr,
            Pte {
                ppn,
                permission: Permission::ReadWrite,
                dma_finish: None,
            },
        );
    }

    pub fn permission_of(&self, vaddr: VAddr) -> Option<Permission> {
        self.entries.lock().unwrap().get(&vaddr).map(|p| p.permission)
    }
}

impl Default for TestPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for TestPageTable {
    fn walk(&self, vaddr: VAddr) -> PteWalk {
        let entries = self.entries.lock().unwrap();
        match entries.get(&vaddr) {
            Some(pte) => PteWalk {
                ppn: Some(pte.ppn),
                fault_reason: None,
                dma_finish_time: pte.dma_finish,
            },
            None => PteWalk {
                ppn: None,
                fault_reason: Some(WalkFault::NotPresent),
                dma_finish_time: None,
            },
        }
    }

    fn check_page_exist(&self, vaddr: VAddr) -> bool {
        self.entries.lock().unwrap().contains_key(&vaddr)
    }

    fn page_moving(&self, vaddr: VAddr) -> Result<(), MigrationError> {
        let mut entries = self.entries.lock().unwrap();
        let pte = entries
            .get_mut(&vaddr)
            .unwrap_or_else(|| panic!("page_moving on unmapped {vaddr}"));
        if pte.permission == Permission::Moving {
            return Err(MigrationError::PteAlreadyMoving { vaddr });
        }
        pte.permission = Permission::Moving;
        Ok(())
    }

    fn dma_move_page(&self, vaddr: VAddr, new_paddr: PAddr, finish_time: u64) {
        let mut entries = self.entries.lock().unwrap();
        let pte = entries
            .get_mut(&vaddr)
            .unwrap_or_else(|| panic!("dma_move_page on unmapped {vaddr}"));
        pte.ppn = new_paddr;
        pte.permission = Permission::ReadWrite;
        pte.dma_finish = Some(finish_time);
    }

    fn with_page_lock(&self, _vaddr: VAddr, f: &mut dyn FnMut()) {
        let _guard = self.entries.lock().unwrap();
        f();
    }
}
