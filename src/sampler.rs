//! Bounded access-sample ring (§3, §4.2, §6).
//!
//! Simulated cores call [`SampleRing::record`] from their memory pipeline;
//! the scanner thread drains it with [`SampleRing::drain_one`]. Overflow
//! drops the oldest sample rather than blocking the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::addr::VAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessSample {
    pub op: MemOp,
    pub vaddr: VAddr,
    pub ip: u64,
    pub app_id: u32,
}

pub struct SampleRing {
    capacity: usize,
    sampling_frequency: u32,
    op_count: AtomicU32,
    buf: Mutex<VecDeque<AccessSample>>,
}

impl SampleRing {
    pub fn new(capacity: usize, sampling_frequency: u32) -> SampleRing {
        SampleRing {
            capacity,
            sampling_frequency: sampling_frequency.max(1),
            op_count: AtomicU32::new(0),
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Called from a simulated core's memory path. Every `sampling_frequency`th
    /// call is actually recorded; the rest are dropped before ever touching
    /// the ring. Returns `true` exactly when this call filled the ring to
    /// capacity, signaling the policy thread should wake (§6).
    pub fn record(&self, vaddr: VAddr, op: MemOp, app_id: u32, ip: u64) -> bool {
        let n = self.op_count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.sampling_frequency != 0 {
            return false;
        }

        let mut buf = self.buf.lock().unwrap();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(AccessSample {
            op,
            vaddr,
            ip,
            app_id,
        });
        buf.len() >= self.capacity
    }

    /// Non-blocking drain of a single sample, oldest first.
    pub fn drain_one(&self) -> Option<AccessSample> {
        self.buf.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}
