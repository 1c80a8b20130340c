//! End-to-end scenarios, one per §8 of the specification this crate
//! implements (see `SPEC_FULL.md` at the repository root). Scenario 6
//! (lazy cooling) is covered by a colocated unit test in
//! `src/policy/sampled_victim.rs` instead, since it exercises a pure
//! decay function that needs no engine wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use tiered_memory::addr::{PAddr, VAddr};
use tiered_memory::clock::TestClock;
use tiered_memory::config::{MigrationConfig, MigrationType, PreferredNode};
use tiered_memory::dma::DmaCommitMap;
use tiered_memory::engine::MigrationEngine;
use tiered_memory::executor::MigrationExecutor;
use tiered_memory::network::{LoopbackNetwork, ShootdownAckMsg};
use tiered_memory::page::ListTag;
use tiered_memory::pagetable::{PageTable, TestPageTable};
use tiered_memory::sampler::MemOp;
use tiered_memory::shootdown::ShootdownCoordinator;
use tiered_memory::tier::{Tier, TierAllocator};

fn small_config() -> MigrationConfig {
    MigrationConfig {
        tiered_memory: true,
        dram_pages: 4,
        nvm_pages: 4,
        dram_reserve_fraction: 0.0,
        preferred_node: PreferredNode::Dram,
        migration_enable: true,
        migration_type: MigrationType::Hemem,
        tlb_shootdown_size: 1,
        tlb_flush_latency_ns: 10,
        ipi_initiate_latency_ns: 10,
        ipi_handle_latency_ns: 10,
        hot_threshold: 2,
        sampling_frequency: 1,
        sample_ring_capacity: 64,
        num_cores: 4,
        hot_ring_reqs_threshold: 2,
        cold_ring_reqs_threshold: 2,
        migrate_rate_bytes: 1 << 20,
        cooling_pages: 64,
        pebs_cooling_threshold: 1000,
        kswapd_interval_ms: 5,
        policy_b_batch_size: 4,
        policy_b_sample_size: 4,
        policy_b_wake_interval_ms: 5,
    }
}

/// Spawns one thread per core that repeatedly services that core's incoming
/// shootdown queue, standing in for the external cycle-accurate simulated
/// cores this crate does not own (§5/§6). Stop via the returned flag, then
/// join the handles.
fn spawn_servicers(engine: Arc<MigrationEngine>, num_cores: usize) -> (Arc<AtomicBool>, Vec<thread::JoinHandle<()>>) {
    let running = Arc::new(AtomicBool::new(true));
    let handles = (0..num_cores)
        .map(|core| {
            let engine = Arc::clone(&engine);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    engine.service_shootdown_queue(core);
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();
    (running, handles)
}

fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Scenario 1: happy promotion. A page fault places 0x1000 in NVM (forced by
/// a full DRAM reserve); two read samples cross the hot threshold; the
/// policy thread promotes it to DRAM.
#[test]
fn happy_promotion() {
    let mut config = small_config();
    config.dram_reserve_fraction = 1.0; // force every fresh allocation into NVM

    let page_table = Arc::new(TestPageTable::new());
    let network = Arc::new(LoopbackNetwork::new());
    let clock = Arc::new(TestClock::new(config.num_cores));

    let engine = MigrationEngine::new(config.clone(), page_table.clone(), network.clone(), clock);
    let (stop_servicers, servicers) = spawn_servicers(Arc::clone(&engine), config.num_cores);

    engine.start();

    let vaddr = VAddr(0x1000);
    let phy = engine.on_page_fault(vaddr);
    page_table.insert(vaddr, phy);
    assert_eq!(engine.free_count(Tier::Nvm), 3, "fault should land in NVM under the forced reserve");

    engine.on_access(vaddr, MemOp::Read, 0, 0);
    engine.on_access(vaddr, MemOp::Read, 0, 0);

    let promoted = poll_until(Duration::from_secs(2), || engine.list_len(ListTag::DramHot) == 1);

    engine.stop();
    stop_servicers.store(false, Ordering::Relaxed);
    for h in servicers {
        let _ = h.join();
    }

    assert!(promoted, "page should have been promoted to dram_hot within the timeout");
    assert_eq!(engine.free_count(Tier::Dram), 3);
    assert_eq!(engine.free_count(Tier::Nvm), 4);
}

struct ExecutorHarness {
    tier: Arc<TierAllocator>,
    executor: Arc<MigrationExecutor>,
    page_table: Arc<TestPageTable>,
    dma_map: Arc<DmaCommitMap>,
    stop_servicers: Arc<AtomicBool>,
    servicers: Vec<thread::JoinHandle<()>>,
}

fn build_executor_harness(config: &MigrationConfig) -> ExecutorHarness {
    let tier = Arc::new(TierAllocator::new(config));
    let page_table: Arc<TestPageTable> = Arc::new(TestPageTable::new());
    let dma_map = Arc::new(DmaCommitMap::new());
    let clock = Arc::new(TestClock::new(config.num_cores));

    let coordinator = Arc::new(ShootdownCoordinator::new(
        config.num_cores,
        config.tlb_flush_latency_ns,
        config.ipi_initiate_latency_ns,
        config.ipi_handle_latency_ns,
        clock.clone(),
        page_table.clone() as Arc<dyn PageTable>,
        dma_map.clone(),
    ));
    let network = Arc::new(LoopbackNetwork::new());
    network.bind(Arc::downgrade(&coordinator));
    coordinator.set_transport(network);

    let executor = Arc::new(MigrationExecutor::new(
        tier.clone(),
        page_table.clone() as Arc<dyn PageTable>,
        coordinator.clone(),
        dma_map.clone(),
        clock,
        config.tlb_shootdown_size,
        config.num_cores,
        0,
    ));

    let running = Arc::new(AtomicBool::new(true));
    let servicers = (0..config.num_cores)
        .map(|core| {
            let coordinator = coordinator.clone();
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    coordinator.service_incoming_queue(core);
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();

    ExecutorHarness {
        tier,
        executor,
        page_table,
        dma_map,
        stop_servicers: running,
        servicers,
    }
}

impl ExecutorHarness {
    fn shutdown(self) {
        self.stop_servicers.store(false, Ordering::Relaxed);
        for h in self.servicers {
            let _ = h.join();
        }
    }
}

/// Scenario 2: swap under pressure. DRAM holds four cold pages A..D; NVM
/// page N becomes hot. A two-page batch swaps one DRAM victim for N.
#[test]
fn swap_under_pressure() {
    let mut config = small_config();
    config.tlb_shootdown_size = 2;
    config.dram_reserve_fraction = 0.0;

    let harness = build_executor_harness(&config);

    let mut dram_ids = Vec::new();
    for i in 0..4u64 {
        let vaddr = VAddr(0x10000 + i * 0x1000);
        let (id, phy) = harness.tier.allocate(vaddr, PreferredNode::Dram, true);
        harness.page_table.insert(vaddr, phy);
        dram_ids.push(id);
    }
    assert_eq!(harness.tier.free_count(Tier::Dram), 0);

    let n_vaddr = VAddr(0x20000);
    let (n_id, n_phy) = harness.tier.allocate(n_vaddr, PreferredNode::Dram, true);
    harness.page_table.insert(n_vaddr, n_phy);
    assert!(harness.tier.with_arena(|a| !a.get(n_id).in_dram), "N must have landed in NVM");

    let victim = dram_ids[0];
    let moved = harness.executor.move_pages(&[(victim, false), (n_id, true)]);
    assert!(moved);

    let (victim_in_dram, n_in_dram) = harness
        .tier
        .with_arena(|a| (a.get(victim).in_dram, a.get(n_id).in_dram));
    assert!(!victim_in_dram, "victim should have been demoted to NVM");
    assert!(n_in_dram, "N should have been promoted to DRAM");
    assert!(harness.dma_map.is_empty(), "commit should have finalized synchronously");

    harness.shutdown();
}

/// Scenario 3: duplicate ack. A manually-replayed duplicate ack from core 1
/// is silently ignored; the wait completes once cores 1, 2, and 3 have each
/// acked exactly once.
#[test]
fn duplicate_ack_is_ignored() {
    let config = small_config();
    let clock = Arc::new(TestClock::new(config.num_cores));
    let page_table: Arc<TestPageTable> = Arc::new(TestPageTable::new());
    let dma_map = Arc::new(DmaCommitMap::new());

    let vaddr = VAddr(0x2000);
    page_table.insert(vaddr, PAddr(0x30000));

    let coordinator = Arc::new(ShootdownCoordinator::new(
        config.num_cores,
        config.tlb_flush_latency_ns,
        config.ipi_initiate_latency_ns,
        config.ipi_handle_latency_ns,
        clock,
        page_table.clone() as Arc<dyn PageTable>,
        dma_map.clone(),
    ));
    let network = Arc::new(LoopbackNetwork::new());
    network.bind(Arc::downgrade(&coordinator));
    coordinator.set_transport(network);

    let initiator = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.enqueue_tlb_shootdown(0, 0, vec![vaddr]))
    };

    thread::sleep(Duration::from_millis(20));

    let dup_ack = ShootdownAckMsg {
        request_id: vaddr,
        from_core: 1,
        flush_result: vec![true],
        page_num: 1,
    };
    coordinator.deliver_ack(0, dup_ack.clone());
    coordinator.deliver_ack(0, dup_ack);

    coordinator.service_incoming_queue(2);
    coordinator.service_incoming_queue(3);

    initiator.join().expect("initiator thread should not panic");
    assert!(dma_map.is_empty());
}

/// Scenario 4: cross-broadcast deadlock avoidance. Two cores each initiate a
/// shootdown for a different vaddr at the same time; each drains the
/// other's broadcast while waiting on its own.
#[test]
fn cross_broadcast_completes_without_deadlock() {
    let mut config = small_config();
    config.num_cores = 2;

    let clock = Arc::new(TestClock::new(config.num_cores));
    let page_table: Arc<TestPageTable> = Arc::new(TestPageTable::new());
    let dma_map = Arc::new(DmaCommitMap::new());

    let v0 = VAddr(0x3000);
    let v1 = VAddr(0x4000);
    page_table.insert(v0, PAddr(0x40000));
    page_table.insert(v1, PAddr(0x50000));

    let coordinator = Arc::new(ShootdownCoordinator::new(
        config.num_cores,
        config.tlb_flush_latency_ns,
        config.ipi_initiate_latency_ns,
        config.ipi_handle_latency_ns,
        clock,
        page_table as Arc<dyn PageTable>,
        dma_map.clone(),
    ));
    let network = Arc::new(LoopbackNetwork::new());
    network.bind(Arc::downgrade(&coordinator));
    coordinator.set_transport(network);

    let c0 = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.enqueue_tlb_shootdown(0, 0, vec![v0]))
    };
    let c1 = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.enqueue_tlb_shootdown(1, 0, vec![v1]))
    };

    c0.join().expect("core 0's shootdown should complete");
    c1.join().expect("core 1's shootdown should complete");

    assert!(dma_map.is_empty());
    assert!(coordinator.queue_is_empty(0));
    assert!(coordinator.queue_is_empty(1));
}

/// Scenario 5: allocator exhaustion. Both tiers are full; `move_pages`
/// reports no progress, touches no PTE, and leaves the DMA-commit map empty.
#[test]
fn allocator_exhaustion_is_tolerated() {
    let mut config = small_config();
    config.dram_pages = 1;
    config.nvm_pages = 1;
    config.dram_reserve_fraction = 0.0;

    let harness = build_executor_harness(&config);

    let dram_vaddr = VAddr(0x5000);
    let (dram_id, dram_phy) = harness.tier.allocate(dram_vaddr, PreferredNode::Dram, true);
    harness.page_table.insert(dram_vaddr, dram_phy);
    assert!(harness.tier.with_arena(|a| a.get(dram_id).in_dram));

    let nvm_vaddr = VAddr(0x6000);
    let (nvm_id, nvm_phy) = harness.tier.allocate(nvm_vaddr, PreferredNode::Dram, true);
    harness.page_table.insert(nvm_vaddr, nvm_phy);
    assert!(!harness.tier.with_arena(|a| a.get(nvm_id).in_dram));

    assert_eq!(harness.tier.free_count(Tier::Dram), 0);
    assert_eq!(harness.tier.free_count(Tier::Nvm), 0);

    let moved = harness.executor.move_pages(&[(nvm_id, true)]);
    assert!(!moved, "no free DRAM frame means the batch must make no progress");
    assert_eq!(harness.page_table.permission_of(nvm_vaddr), Some(tiered_memory::pagetable::Permission::ReadWrite));
    assert!(harness.dma_map.is_empty());
    assert!(harness.tier.with_arena(|a| !a.get(nvm_id).in_dram), "page must remain in its original tier");

    harness.shutdown();
}

/// Round-trip property: `allocate` then `deallocate` returns the frame to
/// its original tier's free pool.
#[test]
fn allocate_deallocate_round_trips() {
    let config = small_config();
    let tier = TierAllocator::new(&config);
    let before = tier.free_count(Tier::Dram);

    let (id, _phy) = tier.allocate(VAddr(0x9000), PreferredNode::Dram, true);
    assert_eq!(tier.free_count(Tier::Dram), before - 1);

    tier.deallocate(id, Tier::Dram);
    assert_eq!(tier.free_count(Tier::Dram), before);
}
