//! The cyclic eviction ring (component E): a doubly linked cycle over
//! every live chunk, with two cursors (`active`/`counter_active`)
//! bounding the "hot window" the eviction policy protects.
//!
//! Modelled as an arena of cells indexed by plain integers, threaded
//! through `next`/`prev` indices owned by a single allocator (this
//! `Ring`) rather than `Rc`/`RefCell` pointers.  Freed cells go on a
//! free list and are recycled, so the arena never shrinks but never
//! leaks either.
use std::collections::HashMap;

use crate::chunk::ChunkId;

type CellIdx = usize;

struct RingCell {
    chunk: ChunkId,
    next: CellIdx,
    prev: CellIdx,
}

/// A cyclic ring over every live chunk.  `active` is the next eviction
/// candidate; `counter_active` trails it, and the arc between them
/// (exclusive of `counter_active`, inclusive of `active`) is the hot
/// window recently touched chunks are spliced into.
pub(crate) struct Ring {
    cells: Vec<Option<RingCell>>,
    free_list: Vec<CellIdx>,
    by_chunk: HashMap<ChunkId, CellIdx>,
    active: Option<CellIdx>,
    counter_active: Option<CellIdx>,
}

impl Default for Ring {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            free_list: Vec::new(),
            by_chunk: HashMap::new(),
            active: None,
            counter_active: None,
        }
    }
}

impl Ring {
    fn alloc_cell(&mut self, cell: RingCell) -> CellIdx {
        if let Some(idx) = self.free_list.pop() {
            self.cells[idx] = Some(cell);
            idx
        } else {
            self.cells.push(Some(cell));
            self.cells.len() - 1
        }
    }

    /// Inserts `chunk` immediately before `active` (i.e., just outside
    /// the hot window, the coldest position in the ring).
    pub(crate) fn insert(&mut self, chunk: ChunkId) {
        let idx = self.alloc_cell(RingCell { chunk, next: 0, prev: 0 });

        match self.active {
            None => {
                self.cells[idx].as_mut().unwrap().next = idx;
                self.cells[idx].as_mut().unwrap().prev = idx;
                self.active = Some(idx);
                self.counter_active = Some(idx);
            }
            Some(active) => {
                let prev = self.cells[active].as_ref().unwrap().prev;
                self.link(prev, idx);
                self.link(idx, active);
            }
        }
        self.by_chunk.insert(chunk, idx);
    }

    fn link(&mut self, a: CellIdx, b: CellIdx) {
        self.cells[a].as_mut().unwrap().next = b;
        self.cells[b].as_mut().unwrap().prev = a;
    }

    pub(crate) fn remove(&mut self, chunk: ChunkId) {
        let idx = match self.by_chunk.remove(&chunk) {
            Some(idx) => idx,
            None => return,
        };

        let (prev, next) = {
            let cell = self.cells[idx].as_ref().unwrap();
            (cell.prev, cell.next)
        };

        if next == idx {
            // Last cell in the ring.
            self.active = None;
            self.counter_active = None;
        } else {
            self.link(prev, next);
            if self.active == Some(idx) {
                self.active = Some(next);
            }
            if self.counter_active == Some(idx) {
                self.counter_active = Some(next);
            }
        }

        self.cells[idx] = None;
        self.free_list.push(idx);
    }

    /// Splices `chunk` to just before `active`, marking it the most
    /// recently touched cold-boundary entry.  No-op if it's already
    /// inside the hot window (between `counter_active` and `active`).
    pub(crate) fn touch(&mut self, chunk: ChunkId) {
        if self.is_in_hot_window(chunk) {
            return;
        }
        self.remove(chunk);
        self.insert(chunk);
    }

    fn is_in_hot_window(&self, chunk: ChunkId) -> bool {
        let (active, counter_active) = match (self.active, self.counter_active) {
            (Some(a), Some(c)) => (a, c),
            _ => return false,
        };
        let idx = match self.by_chunk.get(&chunk) {
            Some(idx) => *idx,
            None => return false,
        };

        let mut cur = counter_active;
        loop {
            if cur == idx {
                return true;
            }
            if cur == active {
                return false;
            }
            cur = self.cells[cur].as_ref().unwrap().next;
        }
    }

    /// Returns the next chunk in ring order after `chunk`, its ring
    /// neighbor. Used by the preemptive swap-in policy to find an
    /// adjacent cold chunk worth prefetching. `None` if `chunk` is
    /// unknown or is the only cell in the ring.
    pub(crate) fn neighbor(&self, chunk: ChunkId) -> Option<ChunkId> {
        let idx = *self.by_chunk.get(&chunk)?;
        let next = self.cells[idx].as_ref()?.next;
        if next == idx {
            return None;
        }
        self.cells[next].as_ref().map(|cell| cell.chunk)
    }

    /// Walks forward from `active`, yielding chunk ids in eviction
    /// order, for at most `limit` cells (a full revolution bound).
    pub(crate) fn candidates(&self, limit: usize) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let start = match self.active {
            Some(idx) => idx,
            None => return out,
        };

        let mut cur = start;
        for _ in 0..limit.min(self.by_chunk.len()) {
            let cell = self.cells[cur].as_ref().unwrap();
            out.push(cell.chunk);
            cur = cell.next;
            if cur == start {
                break;
            }
        }
        out
    }

    /// Advances `active` past `n` cells (called after a successful
    /// batch eviction starting at the old `active`).
    pub(crate) fn advance_active(&mut self, n: usize) {
        if let Some(mut cur) = self.active {
            for _ in 0..n {
                cur = self.cells[cur].as_ref().unwrap().next;
            }
            self.active = Some(cur);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_chunk.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU32;

    fn id(n: u32) -> ChunkId {
        // ChunkId's constructor is crate-private; rebuild it the same
        // way the registry does for this unit test.
        unsafe { std::mem::transmute(NonZeroU32::new(n).unwrap()) }
    }

    #[test]
    fn insert_and_remove_keeps_cycle() {
        let mut ring = Ring::default();
        ring.insert(id(1));
        ring.insert(id(2));
        ring.insert(id(3));
        assert_eq!(ring.len(), 3);

        let candidates = ring.candidates(10);
        assert_eq!(candidates.len(), 3);

        ring.remove(id(2));
        assert_eq!(ring.len(), 2);
        assert!(ring.candidates(10).iter().all(|c| *c != id(2)));
    }

    #[test]
    fn touch_is_idempotent_inside_window() {
        let mut ring = Ring::default();
        ring.insert(id(1));
        ring.insert(id(2));
        ring.touch(id(1));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn neighbor_walks_forward_and_wraps() {
        let mut ring = Ring::default();
        ring.insert(id(1));
        assert_eq!(ring.neighbor(id(1)), None, "a single cell has no distinct neighbor");

        ring.insert(id(2));
        ring.insert(id(3));
        let mut seen = std::collections::HashSet::new();
        let mut cur = id(1);
        for _ in 0..3 {
            let next = ring.neighbor(cur).expect("ring of 3 always has a neighbor");
            assert!(seen.insert(next), "should visit each cell once per revolution");
            cur = next;
        }
        assert_eq!(cur, id(1), "three hops around a 3-cell ring returns to the start");
    }
}
