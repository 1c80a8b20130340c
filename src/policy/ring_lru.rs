//! Policy A: ring-LRU promotion/demotion (§4.3).
//!
//! [`RingLruPolicy::on_access_sample`] (called by the engine's shared
//! scanner thread for every drained sample) bumps per-page read/write
//! counters and reclassifies a page's temperature by pushing it onto
//! `hot_ring` (crossed a hot threshold) or `cold_ring` (decayed back below
//! both thresholds while still marked hot). The policy's own wake thread
//! drains both rings each wake to re-file pages onto their current tier's
//! hot/cold list, runs a byte-bounded migration loop that promotes
//! genuinely hot NVM pages (demoting a DRAM-cold victim first if needed),
//! and periodically walks the DRAM-hot/NVM-hot lists looking for pages that
//! have gone cold long enough to demote (the "cooling scan").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::addr::PAGE_SIZE;
use crate::config::MigrationConfig;
use crate::executor::MigrationExecutor;
use crate::lists::HotColdLists;
use crate::page::{ListTag, PageId};
use crate::sampler::{AccessSample, MemOp};
use crate::tier::{Tier, TierAllocator};

use super::MigrationPolicy;

/// Resumable cursor into a hot list's current snapshot, so consecutive
/// cooling-scan passes don't always re-examine the same head pages.
struct Cursor {
    pos: Mutex<usize>,
}

impl Cursor {
    fn new() -> Cursor {
        Cursor { pos: Mutex::new(0) }
    }

    fn next_window(&self, len: usize, window: usize) -> (usize, usize) {
        if len == 0 {
            return (0, 0);
        }
        let mut pos = self.pos.lock().unwrap();
        let start = *pos % len;
        let end = (start + window.min(len)).min(len);
        *pos = if end >= len { 0 } else { end };
        (start, end)
    }
}

pub struct RingLruPolicy {
    config: MigrationConfig,
    tier: Arc<TierAllocator>,
    lists: Arc<HotColdLists>,
    executor: Arc<MigrationExecutor>,

    hot_ring: Mutex<VecDeque<PageId>>,
    cold_ring: Mutex<VecDeque<PageId>>,

    global_clock: AtomicU64,
    dram_need_cool: AtomicBool,
    nvm_need_cool: AtomicBool,
    dram_cursor: Cursor,
    nvm_cursor: Cursor,
}

impl RingLruPolicy {
    pub fn new(
        config: MigrationConfig,
        tier: Arc<TierAllocator>,
        lists: Arc<HotColdLists>,
        executor: Arc<MigrationExecutor>,
    ) -> RingLruPolicy {
        RingLruPolicy {
            config,
            tier,
            lists,
            executor,
            hot_ring: Mutex::new(VecDeque::new()),
            cold_ring: Mutex::new(VecDeque::new()),
            global_clock: AtomicU64::new(0),
            dram_need_cool: AtomicBool::new(false),
            nvm_need_cool: AtomicBool::new(false),
            dram_cursor: Cursor::new(),
            nvm_cursor: Cursor::new(),
        }
    }

    fn advance_clock(&self) {
        let prev = self.global_clock.fetch_add(1, Ordering::Relaxed);
        let threshold = self.config.pebs_cooling_threshold;
        if threshold > 0 && (prev + 1) % threshold == 0 {
            self.dram_need_cool.store(true, Ordering::Relaxed);
            self.nvm_need_cool.store(true, Ordering::Relaxed);
        }
    }

    fn wake_loop(&self, still_run: &AtomicBool) {
        while still_run.load(Ordering::Relaxed) {
            let mut did_work = false;

            did_work |= self.drain_ring(&self.hot_ring, true);
            did_work |= self.drain_ring(&self.cold_ring, false);
            did_work |= self.run_migration_loop();
            did_work |= self.run_cooling_scan(Tier::Dram);
            did_work |= self.run_cooling_scan(Tier::Nvm);

            if !did_work {
                thread::sleep(Duration::from_millis(self.config.kswapd_interval_ms));
            }
        }
    }

    /// §4.3 policy steps 1-2: re-files pages onto the hot or cold list of
    /// their *current* tier. This never crosses DRAM/NVM — that only happens
    /// in the migration loop below.
    fn drain_ring(&self, ring: &Mutex<VecDeque<PageId>>, to_hot: bool) -> bool {
        let limit = if to_hot {
            self.config.hot_ring_reqs_threshold
        } else {
            self.config.cold_ring_reqs_threshold
        };
        let mut any = false;

        for _ in 0..limit {
            let Some(id) = ring.lock().unwrap().pop_front() else {
                break;
            };
            let (in_dram, current_list) = self.tier.with_arena(|a| {
                let rec = a.get(id);
                (rec.in_dram, rec.current_list)
            });
            let dest = ListTag::for_tier(in_dram, to_hot);

            if let Some(from) = current_list {
                if from != dest {
                    self.lists.move_between(&self.tier, from, dest, id);
                }
            } else {
                self.lists.enqueue(&self.tier, dest, id);
            }
            self.tier.with_arena_mut(|a| {
                let rec = a.get_mut(id);
                rec.hot = to_hot;
                rec.ring_present = false;
            });
            any = true;
        }

        any
    }

    /// §4.3 policy step 3: byte-bounded promotion loop over `nvm_hot_list`.
    fn run_migration_loop(&self) -> bool {
        let mut migrated_bytes: u64 = 0;
        let mut any = false;

        loop {
            if migrated_bytes >= self.config.migrate_rate_bytes {
                break;
            }
            let Some(id) = self.lists.dequeue(&self.tier, ListTag::NvmHot) else {
                break;
            };

            let still_hot = self.tier.with_arena(|a| {
                let rec = a.get(id);
                rec.accesses.reads >= self.config.hot_ring_reqs_threshold as u64
                    || rec.accesses.writes >= self.config.hot_ring_reqs_threshold as u64
            });
            if !still_hot {
                self.lists.enqueue(&self.tier, ListTag::NvmCold, id);
                continue;
            }

            if self.tier.free_count(Tier::Dram) == 0 && !self.demote_one_victim() {
                // Neither a free DRAM frame nor a demotable victim: abort the
                // batch and restore the page to where it came from (§4.5
                // failure case / §9 open question (b)).
                self.lists.enqueue(&self.tier, ListTag::NvmHot, id);
                break;
            }

            if self.executor.move_pages(&[(id, true)]) {
                self.lists.enqueue(&self.tier, ListTag::DramHot, id);
                migrated_bytes += PAGE_SIZE;
                any = true;
            } else {
                self.lists.enqueue(&self.tier, ListTag::NvmHot, id);
                break;
            }
        }

        any
    }

    /// Demotes the LRU entry of `dram_cold_list` to make room for a pending
    /// promotion. Returns whether a victim was found and moved.
    fn demote_one_victim(&self) -> bool {
        let Some(victim) = self.lists.dequeue(&self.tier, ListTag::DramCold) else {
            return false;
        };
        let moved = self.executor.move_pages(&[(victim, false)]);
        if moved {
            self.lists.enqueue(&self.tier, ListTag::NvmCold, victim);
        } else {
            self.lists.enqueue(&self.tier, ListTag::DramCold, victim);
        }
        moved
    }

    /// Peek-and-move cooling scan (§4.2/§4.3 step 4): walks a bounded window
    /// of `tier`'s hot list starting from its resumable cursor, decaying
    /// counters by elapsed global-clock ticks and demoting any page whose
    /// decayed counters fall below the hot thresholds.
    fn run_cooling_scan(&self, tier: Tier) -> bool {
        let (flag, cursor, hot_tag, cold_tag) = match tier {
            Tier::Dram => (&self.dram_need_cool, &self.dram_cursor, ListTag::DramHot, ListTag::DramCold),
            Tier::Nvm => (&self.nvm_need_cool, &self.nvm_cursor, ListTag::NvmHot, ListTag::NvmCold),
        };
        if !flag.load(Ordering::Relaxed) {
            return false;
        }

        let snapshot = self.lists.snapshot(hot_tag);
        let (start, end) = cursor.next_window(snapshot.len(), self.config.cooling_pages);
        let now = self.global_clock.load(Ordering::Relaxed);
        let mut any = false;

        for &id in &snapshot[start..end] {
            let decayed_below = self.tier.with_arena_mut(|a| {
                let rec = a.get_mut(id);
                let elapsed = now.saturating_sub(rec.local_clock);
                if elapsed > 0 {
                    rec.accesses.reads = decay(rec.accesses.reads, elapsed);
                    rec.accesses.writes = decay(rec.accesses.writes, elapsed);
                    rec.local_clock = now;
                }
                rec.accesses.reads < self.config.hot_ring_reqs_threshold as u64
                    && rec.accesses.writes < self.config.hot_ring_reqs_threshold as u64
            });

            if decayed_below && self.lists.remove(&self.tier, hot_tag, id) {
                self.tier.with_arena_mut(|a| a.get_mut(id).hot = false);
                self.lists.enqueue(&self.tier, cold_tag, id);
                any = true;
            }
        }

        if end >= snapshot.len() {
            flag.store(false, Ordering::Relaxed);
        }
        any
    }
}

fn decay(counter: u64, shift: u64) -> u64 {
    if shift >= 63 {
        0
    } else {
        counter >> shift
    }
}

impl MigrationPolicy for RingLruPolicy {
    fn on_page_fault(&self, id: PageId) {
        let in_dram = self.tier.with_arena(|a| a.get(id).in_dram);
        self.lists.enqueue(&self.tier, ListTag::for_tier(in_dram, false), id);
    }

    fn on_access_sample(&self, sample: AccessSample) {
        let Some(id) = self.tier.with_arena(|a| a.lookup_vaddr(sample.vaddr)) else {
            self.advance_clock();
            return;
        };

        let (reads, writes, hot, ring_present) = self.tier.with_arena_mut(|a| {
            let rec = a.get_mut(id);
            match sample.op {
                MemOp::Read => rec.accesses.reads += 1,
                MemOp::Write => rec.accesses.writes += 1,
            }
            (rec.accesses.reads, rec.accesses.writes, rec.hot, rec.ring_present)
        });

        let hot_threshold = self.config.hot_ring_reqs_threshold as u64;
        let cold_threshold = self.config.cold_ring_reqs_threshold as u64;

        if !ring_present && !hot && (reads >= hot_threshold || writes >= hot_threshold) {
            self.tier.with_arena_mut(|a| a.get_mut(id).ring_present = true);
            self.hot_ring.lock().unwrap().push_back(id);
        } else if !ring_present && hot && reads < cold_threshold && writes < cold_threshold {
            self.tier.with_arena_mut(|a| a.get_mut(id).ring_present = true);
            self.cold_ring.lock().unwrap().push_back(id);
        }

        self.advance_clock();
    }

    fn start(self: Arc<Self>, still_run: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("ring-lru-policy".into())
            .spawn(move || self.wake_loop(&still_run))
            .expect("spawn ring-lru policy thread")
    }
}
