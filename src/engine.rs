//! Top-level facade wiring the allocator, lists, sampler, executor,
//! shootdown coordinator, and a chosen policy into one engine (§4.8, ADDED).
//!
//! Owns the one shared scanner thread (§5: "Scanner (1 thread) drains the
//! global sample ring") and forwards each drained sample into the active
//! policy's [`MigrationPolicy::on_access_sample`]; the policy's own thread
//! (spawned by its `start`) only runs the periodic migration-batch logic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::addr::{PAddr, VAddr};
use crate::clock::SimClock;
use crate::config::{MigrationConfig, MigrationType};
use crate::dma::DmaCommitMap;
use crate::executor::MigrationExecutor;
use crate::lists::HotColdLists;
use crate::network::NetworkTransport;
use crate::page::ListTag;
use crate::pagetable::PageTable;
use crate::policy::ring_lru::RingLruPolicy;
use crate::policy::sampled_victim::SampledVictimPolicy;
use crate::policy::MigrationPolicy;
use crate::sampler::{MemOp, SampleRing};
use crate::shootdown::ShootdownCoordinator;
use crate::tier::{Tier, TierAllocator};

pub struct MigrationEngine {
    config: MigrationConfig,
    tier: Arc<TierAllocator>,
    lists: Arc<HotColdLists>,
    sampler: Arc<SampleRing>,
    shootdown: Arc<ShootdownCoordinator>,
    policy: Arc<dyn MigrationPolicy>,

    still_run: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MigrationEngine {
    /// Builds the engine from an already-constructed config plus the two
    /// external collaborators (§6) an embedder provides: the page table and
    /// the network transport. `clock` is this crate's own simulated-time
    /// source (§2.1 ADDED ambient stack).
    pub fn new(
        config: MigrationConfig,
        page_table: Arc<dyn PageTable>,
        network: Arc<dyn NetworkTransport>,
        clock: Arc<dyn SimClock>,
    ) -> Arc<MigrationEngine> {
        let tier = Arc::new(TierAllocator::new(&config));
        let lists = Arc::new(HotColdLists::new());
        let sampler = Arc::new(SampleRing::new(config.sample_ring_capacity, config.sampling_frequency));
        let dma_map = Arc::new(DmaCommitMap::new());

        let shootdown = Arc::new(ShootdownCoordinator::new(
            config.num_cores,
            config.tlb_flush_latency_ns,
            config.ipi_initiate_latency_ns,
            config.ipi_handle_latency_ns,
            Arc::clone(&clock),
            Arc::clone(&page_table),
            Arc::clone(&dma_map),
        ));
        shootdown.set_transport(Arc::clone(&network));
        network.bind_coordinator(Arc::downgrade(&shootdown));

        let executor = Arc::new(MigrationExecutor::new(
            Arc::clone(&tier),
            Arc::clone(&page_table),
            Arc::clone(&shootdown),
            Arc::clone(&dma_map),
            Arc::clone(&clock),
            config.tlb_shootdown_size,
            config.num_cores,
            0,
        ));

        let policy: Arc<dyn MigrationPolicy> = match config.migration_type {
            MigrationType::Hemem => Arc::new(RingLruPolicy::new(
                config.clone(),
                Arc::clone(&tier),
                Arc::clone(&lists),
                Arc::clone(&executor),
            )),
            MigrationType::Memtis => Arc::new(SampledVictimPolicy::new(
                config.clone(),
                Arc::clone(&tier),
                Arc::clone(&lists),
                Arc::clone(&executor),
            )),
        };

        Arc::new(MigrationEngine {
            config,
            tier,
            lists,
            sampler,
            shootdown,
            policy,
            still_run: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Handles a page fault (§4.1): allocates a fresh frame for `vaddr`,
    /// then lets the active policy file it onto its initial hot/cold list.
    pub fn on_page_fault(&self, vaddr: VAddr) -> PAddr {
        let (id, phy) = self.tier.allocate(vaddr, self.config.preferred_node, self.config.tiered_memory);
        self.policy.on_page_fault(id);
        phy
    }

    /// Records a single memory access for the sampling pipeline (§4.2). Only
    /// `sampling_frequency`-th calls are actually retained by the ring.
    pub fn on_access(&self, vaddr: VAddr, op: MemOp, app_id: u32, ip: u64) {
        if !self.config.migration_enable {
            return;
        }
        let _filled: bool = self.sampler.record(vaddr, op, app_id, ip);
    }

    pub fn free_count(&self, tier: Tier) -> usize {
        self.tier.free_count(tier)
    }

    pub fn list_len(&self, tag: ListTag) -> usize {
        self.lists.len(tag)
    }

    /// Services `core`'s incoming shootdown queue once (§4.6 remote path).
    /// The embedder's simulated-core loop for `core` is expected to call
    /// this every cycle (or every few cycles) so the core keeps acking
    /// peer-broadcast shootdowns even while it is not itself migrating
    /// anything.
    pub fn service_shootdown_queue(&self, core: usize) {
        self.shootdown.service_incoming_queue(core);
    }

    fn scanner_loop(policy: Arc<dyn MigrationPolicy>, sampler: Arc<SampleRing>, still_run: Arc<AtomicBool>, idle_ms: u64) {
        while still_run.load(Ordering::Relaxed) {
            match sampler.drain_one() {
                Some(sample) => policy.on_access_sample(sample),
                None => thread::sleep(Duration::from_millis(idle_ms)),
            }
        }
    }

    /// Spawns the shared scanner thread and the policy's own wake thread
    /// (§4.8). Idempotent only in the sense that calling twice without an
    /// intervening `stop` leaks threads; embedders are expected to pair
    /// every `start` with a `stop`.
    pub fn start(self: &Arc<Self>) {
        self.still_run.store(true, Ordering::SeqCst);

        let scanner = {
            let policy = Arc::clone(&self.policy);
            let sampler = Arc::clone(&self.sampler);
            let still_run = Arc::clone(&self.still_run);
            let idle_ms = self.config.kswapd_interval_ms;
            thread::Builder::new()
                .name("migration-scanner".into())
                .spawn(move || Self::scanner_loop(policy, sampler, still_run, idle_ms))
                .expect("spawn migration scanner thread")
        };
        let policy_thread = Arc::clone(&self.policy).start(Arc::clone(&self.still_run));

        *self.handles.lock().unwrap() = vec![scanner, policy_thread];
    }

    pub fn stop(self: &Arc<Self>) {
        self.still_run.store(false, Ordering::SeqCst);
        self.policy.stop();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }
}
