//! Hot/cold FIFO lists (§4.2).
//!
//! The source links pages with raw predecessor/successor pointers under one
//! mutex per list. Here each list is a `Mutex<VecDeque<PageId>>` — the arena
//! already gives every page a stable id, so there is nothing left for an
//! intrusive link to buy us. `PageRecord::current_list` still records which
//! list (if any) currently holds a page, so `enqueue` can assert against the
//! "already linked" programming error the source treats as a bug.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::page::{ListTag, PageId};
use crate::tier::TierAllocator;

pub struct HotColdLists {
    lists: [Mutex<VecDeque<PageId>>; 4],
}

impl HotColdLists {
    pub fn new() -> HotColdLists {
        HotColdLists {
            lists: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
        }
    }

    /// Rejects an already-linked page, mirroring the source's enqueue assert.
    pub fn enqueue(&self, tier: &TierAllocator, tag: ListTag, id: PageId) {
        let mut list = self.lists[tag.index()].lock().unwrap();
        tier.with_arena_mut(|arena| {
            let rec = arena.get_mut(id);
            assert!(
                rec.current_list.is_none(),
                "page {:?} enqueued onto {:?} while already linked in {:?}",
                id,
                tag,
                rec.current_list
            );
            rec.current_list = Some(tag);
        });
        list.push_back(id);
    }

    pub fn dequeue(&self, tier: &TierAllocator, tag: ListTag) -> Option<PageId> {
        let mut list = self.lists[tag.index()].lock().unwrap();
        let id = list.pop_front()?;
        tier.with_arena_mut(|arena| arena.get_mut(id).current_list = None);
        Some(id)
    }

    pub fn len(&self, tag: ListTag) -> usize {
        self.lists[tag.index()].lock().unwrap().len()
    }

    pub fn is_empty(&self, tag: ListTag) -> bool {
        self.len(tag) == 0
    }

    /// Removes a specific page from `tag`'s list, returning whether it was
    /// found there. Used by the cooling scan to unlink a candidate before
    /// re-appending it elsewhere.
    pub fn remove(&self, tier: &TierAllocator, tag: ListTag, id: PageId) -> bool {
        let mut list = self.lists[tag.index()].lock().unwrap();
        match list.iter().position(|&x| x == id) {
            Some(pos) => {
                list.remove(pos);
                tier.with_arena_mut(|arena| arena.get_mut(id).current_list = None);
                true
            }
            None => false,
        }
    }

    /// Moves `id` from `from` to `to`, taking both list locks in a fixed
    /// (index) order regardless of call-site direction, per the §9 design
    /// note on cross-list moves.
    pub fn move_between(&self, tier: &TierAllocator, from: ListTag, to: ListTag, id: PageId) {
        assert_ne!(from.index(), to.index());
        let (lo, hi) = if from.index() < to.index() {
            (from, to)
        } else {
            (to, from)
        };
        let mut lo_list = self.lists[lo.index()].lock().unwrap();
        let mut hi_list = self.lists[hi.index()].lock().unwrap();

        if from.index() == lo.index() {
            let pos = lo_list
                .iter()
                .position(|&x| x == id)
                .expect("page missing from its recorded source list");
            lo_list.remove(pos);
            hi_list.push_back(id);
        } else {
            let pos = hi_list
                .iter()
                .position(|&x| x == id)
                .expect("page missing from its recorded source list");
            hi_list.remove(pos);
            lo_list.push_back(id);
        }
        tier.with_arena_mut(|arena| arena.get_mut(id).current_list = Some(to));
    }

    /// A cheap snapshot of `tag`'s current membership, oldest first, for the
    /// cooling scan to walk without holding the list lock across per-page
    /// arena work.
    pub fn snapshot(&self, tag: ListTag) -> Vec<PageId> {
        self.lists[tag.index()].lock().unwrap().iter().copied().collect()
    }
}

impl Default for HotColdLists {
    fn default() -> Self {
        Self::new()
    }
}
