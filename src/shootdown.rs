//! Distributed TLB-shootdown protocol (§4.6).
//!
//! Three actors touch this state: the **initiator** (whichever thread calls
//! [`ShootdownCoordinator::enqueue_tlb_shootdown`], typically the migration
//! executor), **remote** cores draining their own queues, and the **ack
//! handler**, which in this crate runs inline inside the network delivery
//! call rather than on a dedicated thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use log::{trace, warn};

use crate::addr::VAddr;
use crate::clock::SimClock;
use crate::dma::DmaCommitMap;
use crate::network::{NetworkTransport, ShootdownAckMsg, ShootdownReqMsg};
use crate::pagetable::PageTable;

/// How long the wait loop blocks on its condvar before re-draining the local
/// queue, bounding the cost of a lost wakeup (§9 design note).
const WAIT_REDRAIN_INTERVAL: Duration = Duration::from_micros(50);

#[derive(Debug, Clone)]
struct ShootdownRequest {
    id: VAddr,
    initiator_core: usize,
    app_id: u32,
    vaddrs: Vec<VAddr>,
}

struct PendingShootdown {
    pending_cores: HashSet<usize>,
    max_end_time: u64,
}

pub struct ShootdownCoordinator {
    num_cores: usize,
    tlb_flush_latency_ns: u64,
    ipi_initiate_latency_ns: u64,
    ipi_handle_latency_ns: u64,

    queues: Vec<Mutex<VecDeque<ShootdownRequest>>>,
    pending: Vec<Mutex<HashMap<VAddr, PendingShootdown>>>,
    condvars: Vec<Condvar>,

    transport: OnceLock<Arc<dyn NetworkTransport>>,
    clock: Arc<dyn SimClock>,
    page_table: Arc<dyn PageTable>,
    dma_map: Arc<DmaCommitMap>,
}

impl ShootdownCoordinator {
    pub fn new(
        num_cores: usize,
        tlb_flush_latency_ns: u64,
        ipi_initiate_latency_ns: u64,
        ipi_handle_latency_ns: u64,
        clock: Arc<dyn SimClock>,
        page_table: Arc<dyn PageTable>,
        dma_map: Arc<DmaCommitMap>,
    ) -> ShootdownCoordinator {
        ShootdownCoordinator {
            num_cores,
            tlb_flush_latency_ns,
            ipi_initiate_latency_ns,
            ipi_handle_latency_ns,
            queues: (0..num_cores).map(|_| Mutex::new(VecDeque::new())).collect(),
            pending: (0..num_cores).map(|_| Mutex::new(HashMap::new())).collect(),
            condvars: (0..num_cores).map(|_| Condvar::new()).collect(),
            transport: OnceLock::new(),
            clock,
            page_table,
            dma_map,
        }
    }

    /// Completes the two-phase wiring with the transport (see
    /// [`crate::network::LoopbackNetwork::bind`]).
    pub fn set_transport(&self, transport: Arc<dyn NetworkTransport>) {
        self.transport
            .set(transport)
            .unwrap_or_else(|_| panic!("ShootdownCoordinator transport already set"));
    }

    fn transport(&self) -> &Arc<dyn NetworkTransport> {
        self.transport
            .get()
            .expect("ShootdownCoordinator used before set_transport()")
    }

    /// `enqueue_tlb_shootdown(vaddrs, initiator, app_id, count)` (§4.5 step
    /// 4). Blocks the calling thread until every other core has acked.
    /// `vaddrs` must be non-empty; `vaddrs[0]` becomes the batch id.
    pub fn enqueue_tlb_shootdown(&self, initiator_core: usize, app_id: u32, vaddrs: Vec<VAddr>) {
        assert!(!vaddrs.is_empty(), "shootdown batch must carry at least one vaddr");
        let id = vaddrs[0];

        // QUEUED: append to the initiator's own queue.
        self.queues[initiator_core].lock().unwrap().push_back(ShootdownRequest {
            id,
            initiator_core,
            app_id,
            vaddrs: vaddrs.clone(),
        });

        // The initiator's drain pulls its own request back off -> BROADCASTING.
        let req = {
            let mut q = self.queues[initiator_core].lock().unwrap();
            let pos = q
                .iter()
                .position(|r| r.id == id && r.initiator_core == initiator_core)
                .expect("own request missing from its own queue");
            q.remove(pos).unwrap()
        };

        self.initiate_tlb_shootdown_broadcast(req);
    }

    fn initiate_tlb_shootdown_broadcast(&self, req: ShootdownRequest) {
        let ShootdownRequest {
            id,
            initiator_core,
            app_id,
            vaddrs,
        } = req;

        // 1. Flush the relevant cache lines locally (cache/coherence model is
        // external per §1; we only log the event here).
        trace!("core {initiator_core} flushing cache lines for shootdown {id}");

        // 2. Charge IPI-initiate latency.
        self.clock.charge(initiator_core, self.ipi_initiate_latency_ns);

        // 3. Create the pending-shootdown record for every other core.
        let pending_cores: HashSet<usize> = (0..self.num_cores).filter(|&c| c != initiator_core).collect();
        {
            let mut pending = self.pending[initiator_core].lock().unwrap();
            pending.insert(
                id,
                PendingShootdown {
                    pending_cores,
                    max_end_time: self.clock.now(initiator_core),
                },
            );
        }

        // 4. Broadcast TLB_SHOOTDOWN_REQ to every other core.
        self.transport().broadcast_shootdown_req(ShootdownReqMsg {
            src_core: initiator_core,
            app_id,
            id,
            vaddrs: vaddrs.clone(),
        });

        // 5. Flush the local TLB and charge IPI-handle latency.
        self.clock.charge(initiator_core, self.tlb_flush_latency_ns);
        self.clock.charge(initiator_core, self.ipi_handle_latency_ns);

        // 6. Wait loop: cooperatively drain remote requests while waiting.
        self.wait_for_acks(initiator_core, id);

        // 7. Erase the pending record; finalize via dma_migrate.
        self.pending[initiator_core].lock().unwrap().remove(&id);
        let now = self.clock.now(initiator_core);
        self.dma_map.commit(id, now, &*self.page_table);
    }

    fn wait_for_acks(&self, core: usize, id: VAddr) {
        loop {
            // (a) Drain remote-only: process every incoming request that is
            // not self-originated; re-queue any that somehow are (defensive;
            // should not happen once our own request has been pulled above).
            self.drain_remote_only(core);

            // (b) Check completion under the pending-map lock.
            let guard = self.pending[core].lock().unwrap();
            let done = match guard.get(&id) {
                Some(ps) => ps.pending_cores.is_empty(),
                None => true,
            };
            if done {
                return;
            }

            let _ = self.condvars[core]
                .wait_timeout(guard, WAIT_REDRAIN_INTERVAL)
                .unwrap();
        }
    }

    /// Services `core`'s incoming shootdown-request queue once, responding
    /// to any request not self-originated. The external simulated-core loop
    /// that owns `core`'s cycle-accurate execution (§5) is expected to call
    /// this periodically so the core keeps acking peer-broadcast requests
    /// even while not itself migrating anything; the initiator's own wait
    /// loop below also calls it, since an initiator is itself a core that
    /// must keep responding to other initiators' broadcasts while it waits.
    pub fn service_incoming_queue(&self, core: usize) {
        self.drain_remote_only(core);
    }

    fn drain_remote_only(&self, core: usize) {
        let mut requeue = Vec::new();
        loop {
            let req = {
                let mut q = self.queues[core].lock().unwrap();
                q.pop_front()
            };
            let Some(req) = req else { break };
            if req.initiator_core == core {
                // Shootdown from self in own queue: skip (§7), preserved for
                // the next drain pass.
                requeue.push(req);
                continue;
            }
            self.handle_remote_tlb_shootdown_request(core, req);
        }
        if !requeue.is_empty() {
            let mut q = self.queues[core].lock().unwrap();
            for req in requeue {
                q.push_back(req);
            }
        }
    }

    fn handle_remote_tlb_shootdown_request(&self, responder_core: usize, req: ShootdownRequest) {
        // 1. Synchronize sim-thread time into the user-thread register: this
        // crate tracks one simulated clock per core, so this is a no-op read.
        let _ = self.clock.now(responder_core);

        // 2. Flush the TLB for each vaddr in the batch, recording per-slot
        // results. Real TLB contents are out of scope (§1); a slot "flushed"
        // iff it carried a real vaddr.
        let flush_result: Vec<bool> = req.vaddrs.iter().map(|v| !v.is_null()).collect();

        // 3. Charge IPI-handle latency.
        self.clock.charge(responder_core, self.ipi_handle_latency_ns);

        // 4. Send the ack back to the initiator.
        self.transport().send_shootdown_ack(
            req.initiator_core,
            ShootdownAckMsg {
                request_id: req.id,
                from_core: responder_core,
                flush_result,
                page_num: req.vaddrs.len(),
            },
        );
    }

    /// Called by the network transport when a broadcast `TLB_SHOOTDOWN_REQ`
    /// arrives. Delivers to every core except the sender.
    pub fn deliver_remote_request(&self, msg: ShootdownReqMsg) {
        let req = ShootdownRequest {
            id: msg.id,
            initiator_core: msg.src_core,
            app_id: msg.app_id,
            vaddrs: msg.vaddrs,
        };
        for core in 0..self.num_cores {
            if core == msg.src_core {
                continue;
            }
            self.queues[core].lock().unwrap().push_back(req.clone());
        }
    }

    /// `network_handle_tlb_shootdown_ack` (§4.6). Duplicate and unknown acks
    /// are ignored silently, per §7.
    pub fn deliver_ack(&self, dst_core: usize, msg: ShootdownAckMsg) {
        {
            let mut pending = self.pending[dst_core].lock().unwrap();
            match pending.get_mut(&msg.request_id) {
                Some(ps) => {
                    let now = self.clock.now(dst_core);
                    ps.max_end_time = ps.max_end_time.max(now);
                    if !ps.pending_cores.remove(&msg.from_core) {
                        trace!(
                            "duplicate ack for shootdown {} from core {}",
                            msg.request_id,
                            msg.from_core
                        );
                    }
                }
                None => {
                    warn!(
                        "ack for unknown or already-completed shootdown {}",
                        msg.request_id
                    );
                }
            }
        }
        self.condvars[dst_core].notify_all();
    }

    pub fn queue_is_empty(&self, core: usize) -> bool {
        self.queues[core].lock().unwrap().is_empty()
    }
}
