//! The network collaborator (§6): broadcast of `TLB_SHOOTDOWN_REQ` and
//! point-to-point `TLB_SHOOTDOWN_ACK`, both carried over whatever
//! cache-coherence network path the embedder's simulator models. The only
//! guarantees this crate requires are in-order delivery per sender/receiver
//! pair and eventual delivery.

use std::sync::{OnceLock, Weak};

use crate::addr::VAddr;
use crate::shootdown::ShootdownCoordinator;

#[derive(Debug, Clone)]
pub struct ShootdownReqMsg {
    pub src_core: usize,
    pub app_id: u32,
    pub id: VAddr,
    pub vaddrs: Vec<VAddr>,
}

#[derive(Debug, Clone)]
pub struct ShootdownAckMsg {
    pub request_id: VAddr,
    pub from_core: usize,
    pub flush_result: Vec<bool>,
    pub page_num: usize,
}

/// Outgoing network path used by [`ShootdownCoordinator`]. An embedder with
/// a real cache-coherence model implements this to add its own delivery
/// latency; this crate's own tests use [`LoopbackNetwork`], which delivers
/// synchronously in-process.
pub trait NetworkTransport: Send + Sync {
    /// Send `msg` to every core other than `msg.src_core` (component tag CORE).
    fn broadcast_shootdown_req(&self, msg: ShootdownReqMsg);
    /// Send `msg` to `dst_core` only.
    fn send_shootdown_ack(&self, dst_core: usize, msg: ShootdownAckMsg);

    /// Completes the two-phase wiring with a coordinator the transport itself
    /// needs a back-reference to (only [`LoopbackNetwork`] does; a transport
    /// backed by a real network path has no use for this and keeps the
    /// default no-op). Called once by [`crate::engine::MigrationEngine::new`]
    /// right after it builds its internal coordinator.
    fn bind_coordinator(&self, _coordinator: Weak<ShootdownCoordinator>) {}
}

/// In-process loopback network: delivers both message kinds by calling
/// straight back into the coordinator. Satisfies in-order/eventual delivery
/// trivially since there is no queuing delay.
pub struct LoopbackNetwork {
    coordinator: OnceLock<Weak<ShootdownCoordinator>>,
}

impl LoopbackNetwork {
    pub fn new() -> LoopbackNetwork {
        LoopbackNetwork {
            coordinator: OnceLock::new(),
        }
    }

    /// Completes the two-phase wiring between the coordinator and its
    /// transport (the two hold circular references to each other).
    pub fn bind(&self, coordinator: Weak<ShootdownCoordinator>) {
        self.coordinator
            .set(coordinator)
            .unwrap_or_else(|_| panic!("LoopbackNetwork already bound"));
    }

    fn coordinator(&self) -> std::sync::Arc<ShootdownCoordinator> {
        self.coordinator
            .get()
            .expect("LoopbackNetwork used before bind()")
            .upgrade()
            .expect("ShootdownCoordinator dropped while network still live")
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTransport for LoopbackNetwork {
    fn broadcast_shootdown_req(&self, msg: ShootdownReqMsg) {
        self.coordinator().deliver_remote_request(msg);
    }

    fn send_shootdown_ack(&self, dst_core: usize, msg: ShootdownAckMsg) {
        self.coordinator().deliver_ack(dst_core, msg);
    }

    fn bind_coordinator(&self, coordinator: Weak<ShootdownCoordinator>) {
        self.bind(coordinator);
    }
}
