//! The swap-file set's free-space allocator (component B): a flat
//! virtual address space of `num_files * file_size` bytes, carved into
//! an intrusive chain of placement nodes.  Nodes are owned by a single
//! arena (this `PlacementArena`) and indexed two ways, exactly as the
//! design calls for: `all_space`, ordered by global offset, used to
//! find a freed node's physical neighbors for coalescing, and
//! `free_space`, the same keys restricted to `Free` nodes, used for
//! first-fit allocation.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::chunk::ChunkId;
use crate::error::RambrainError;

/// Almost every placement resolves to a single file region; only a
/// request that outgrew the free space in one file fragments across
/// several. Inline room for two avoids a heap allocation on the
/// common path.
pub(crate) type RegionList = SmallVec<[FileRegion; 2]>;

type NodeIdx = usize;

/// Opaque handle to a (possibly multi-node) placement.  Internally,
/// the head of the node chain backing one chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PlacementId(NodeIdx);

impl PlacementId {
    /// Builds a `PlacementId` from a backend-private slot index.  Used
    /// by [`crate::swap::MemorySwap`], which has no node arena of its
    /// own and just needs an opaque handle of the same type the
    /// file-backed engine produces.
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeStatus {
    Free,
    /// Non-terminal piece of a fragmented placement.
    Part,
    /// Terminal piece; carries the owning chunk.
    End,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    offset: u64,
    length: u64,
    status: NodeStatus,
    chain_next: Option<NodeIdx>,
    owner: Option<ChunkId>,
}

/// One (file_index, offset_in_file) pair a `Node` resolves to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FileRegion {
    pub(crate) file_index: usize,
    pub(crate) offset_in_file: u64,
    pub(crate) length: u64,
}

pub(crate) struct PlacementArena {
    nodes: Vec<Option<Node>>,
    free_list: Vec<NodeIdx>,
    all_space: BTreeMap<u64, NodeIdx>,
    free_space: BTreeMap<u64, NodeIdx>,
    file_size: u64,
    num_files: usize,
}

impl PlacementArena {
    pub(crate) fn new(file_size: u64) -> Self {
        Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
            all_space: BTreeMap::new(),
            free_space: BTreeMap::new(),
            file_size,
            num_files: 0,
        }
    }

    pub(crate) fn num_files(&self) -> usize {
        self.num_files
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.num_files as u64 * self.file_size
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free_space
            .values()
            .map(|idx| self.nodes[*idx].unwrap().length)
            .sum()
    }

    fn alloc_node(&mut self, node: Node) -> NodeIdx {
        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn insert_free(&mut self, idx: NodeIdx) {
        let offset = self.nodes[idx].unwrap().offset;
        self.all_space.insert(offset, idx);
        self.free_space.insert(offset, idx);
    }

    /// Appends `n` whole files to the backing set, registering the new
    /// range as a single `Free` node (merged with a trailing free node
    /// if one happens to end exactly at the old boundary).
    pub(crate) fn extend_files(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        let start = self.num_files as u64 * self.file_size;
        let length = n as u64 * self.file_size;
        self.num_files += n;

        let idx = self.alloc_node(Node {
            offset: start,
            length,
            status: NodeStatus::Free,
            chain_next: None,
            owner: None,
        });
        self.insert_free(idx);
        self.coalesce(idx);
    }

    /// Returns `Err` when `all_space`/`free_space` have drifted apart,
    /// or a `Free` node's neighbors should have been coalesced but
    /// weren't.
    #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
    fn check_rep_or_err(&self) -> Result<(), &'static str> {
        if self.free_space.len()
            != self
                .all_space
                .values()
                .filter(|idx| self.nodes[**idx].unwrap().status == NodeStatus::Free)
                .count()
        {
            return Err("free_space and all_space disagree on which nodes are free.");
        }

        let mut prev_free_end: Option<u64> = None;
        for (&offset, &idx) in self.all_space.iter() {
            let node = self.nodes[idx].unwrap();
            if node.status == NodeStatus::Free {
                if prev_free_end == Some(offset) {
                    return Err("adjacent Free nodes should have been coalesced.");
                }
                prev_free_end = Some(offset + node.length);
            } else {
                prev_free_end = None;
            }
        }

        Ok(())
    }

    /// First-fit, falling back to fragmentation across several free
    /// nodes, per the design's `pfAlloc` algorithm.  Returns
    /// `OutOfSwap` if the combined free space can't cover `size` even
    /// after accumulating every free node.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    pub(crate) fn alloc(&mut self, size: u64, owner: ChunkId) -> Result<PlacementId, RambrainError> {
        // First-fit: one node big enough on its own.
        if let Some((&offset, &idx)) = self
            .free_space
            .iter()
            .find(|(_, idx)| self.nodes[**idx].unwrap().length >= size)
        {
            let _ = offset;
            return Ok(PlacementId(self.carve_single(idx, size, owner)));
        }

        // Otherwise, accumulate ascending free nodes until they cover `size`.
        let candidates: Vec<NodeIdx> = self.free_space.values().copied().collect();
        let total: u64 = candidates.iter().map(|idx| self.nodes[*idx].unwrap().length).sum();
        if total < size {
            return Err(RambrainError::OutOfSwap {
                requested: size as usize,
                available: total as usize,
            });
        }

        Ok(PlacementId(self.carve_fragmented(&candidates, size, owner)))
    }

    /// Splits a single free node into an allocated `End` node of
    /// `size` bytes and a residual `Free` node for the remainder (if
    /// any remains).
    fn carve_single(&mut self, idx: NodeIdx, size: u64, owner: ChunkId) -> NodeIdx {
        let node = self.nodes[idx].unwrap();
        self.remove_free(idx);

        let remainder = node.length - size;
        self.nodes[idx] = Some(Node {
            offset: node.offset,
            length: size,
            status: NodeStatus::End,
            chain_next: None,
            owner: Some(owner),
        });
        self.all_space.insert(node.offset, idx);

        if remainder > 0 {
            let free_idx = self.alloc_node(Node {
                offset: node.offset + size,
                length: remainder,
                status: NodeStatus::Free,
                chain_next: None,
                owner: None,
            });
            self.insert_free(free_idx);
        }

        idx
    }

    fn carve_fragmented(&mut self, candidates: &[NodeIdx], mut needed: u64, owner: ChunkId) -> NodeIdx {
        let mut head: Option<NodeIdx> = None;
        let mut tail: Option<NodeIdx> = None;

        for &idx in candidates {
            if needed == 0 {
                break;
            }
            let node = self.nodes[idx].unwrap();
            self.remove_free(idx);

            let take = node.length.min(needed);
            let is_last = take == needed;

            self.nodes[idx] = Some(Node {
                offset: node.offset,
                length: take,
                status: if is_last { NodeStatus::End } else { NodeStatus::Part },
                chain_next: None,
                owner: if is_last { Some(owner) } else { None },
            });
            self.all_space.insert(node.offset, idx);

            if let Some(t) = tail {
                self.nodes[t].as_mut().unwrap().chain_next = Some(idx);
            }
            head.get_or_insert(idx);
            tail = Some(idx);
            needed -= take;

            let remainder = node.length - take;
            if remainder > 0 {
                let free_idx = self.alloc_node(Node {
                    offset: node.offset + take,
                    length: remainder,
                    status: NodeStatus::Free,
                    chain_next: None,
                    owner: None,
                });
                self.insert_free(free_idx);
            }
        }

        head.expect("caller already verified total capacity covers `size`")
    }

    fn remove_free(&mut self, idx: NodeIdx) {
        let offset = self.nodes[idx].unwrap().offset;
        self.free_space.remove(&offset);
    }

    /// Releases every node in the chain rooted at `placement`, merging
    /// each with its physical neighbors in `all_space` if they are
    /// also `Free`.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    pub(crate) fn free(&mut self, placement: PlacementId) {
        let mut cur = Some(placement.0);
        while let Some(idx) = cur {
            let node = self.nodes[idx].unwrap();
            cur = node.chain_next;

            self.all_space.remove(&node.offset);
            self.nodes[idx] = Some(Node {
                status: NodeStatus::Free,
                chain_next: None,
                owner: None,
                ..node
            });
            self.insert_free(idx);
            self.coalesce(idx);
        }
    }

    /// Merges the `Free` node at `idx` with an immediately adjacent
    /// `Free` node on either side, if one exists.
    fn coalesce(&mut self, idx: NodeIdx) {
        let node = self.nodes[idx].unwrap();

        // Left neighbor: the node whose offset + length == node.offset.
        if node.offset > 0 {
            if let Some((&left_offset, &left_idx)) = self.all_space.range(..node.offset).next_back() {
                let left = self.nodes[left_idx].unwrap();
                if left.status == NodeStatus::Free && left_offset + left.length == node.offset {
                    self.merge_two(left_idx, idx);
                    return self.coalesce(left_idx);
                }
            }
        }

        // Right neighbor: the node whose offset == node.offset + node.length.
        let right_offset = node.offset + node.length;
        if let Some(&right_idx) = self.all_space.get(&right_offset) {
            let right = self.nodes[right_idx].unwrap();
            if right.status == NodeStatus::Free {
                self.merge_two(idx, right_idx);
                return self.coalesce(idx);
            }
        }
    }

    fn merge_two(&mut self, left: NodeIdx, right: NodeIdx) {
        let l = self.nodes[left].unwrap();
        let r = self.nodes[right].unwrap();
        debug_assert_eq!(l.offset + l.length, r.offset);

        self.all_space.remove(&l.offset);
        self.all_space.remove(&r.offset);
        self.free_space.remove(&l.offset);
        self.free_space.remove(&r.offset);
        self.nodes[right] = None;
        self.free_list.push(right);

        self.nodes[left] = Some(Node {
            length: l.length + r.length,
            ..l
        });
        self.all_space.insert(l.offset, left);
        self.free_space.insert(l.offset, left);
    }

    /// Resolves every node in `placement`'s chain to a concrete
    /// `(file_index, offset_in_file, length)` triple, in order.
    pub(crate) fn regions(&self, placement: PlacementId) -> RegionList {
        let mut out = RegionList::new();
        let mut cur = Some(placement.0);
        while let Some(idx) = cur {
            let node = self.nodes[idx].unwrap();
            out.push(FileRegion {
                file_index: (node.offset / self.file_size) as usize,
                offset_in_file: node.offset % self.file_size,
                length: node.length,
            });
            cur = node.chain_next;
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU32;

    fn id(n: u32) -> ChunkId {
        unsafe { std::mem::transmute(NonZeroU32::new(n).unwrap()) }
    }

    #[test]
    fn alloc_free_roundtrip_leaves_all_free() {
        let mut arena = PlacementArena::new(1 << 16);
        arena.extend_files(4);
        let total_before = arena.free_bytes();

        let p1 = arena.alloc(1000, id(1)).unwrap();
        let p2 = arena.alloc(2000, id(2)).unwrap();
        assert!(arena.free_bytes() < total_before);

        arena.free(p1);
        arena.free(p2);
        assert_eq!(arena.free_bytes(), total_before);
        assert_eq!(arena.free_space.len(), 1, "coalescing should leave one free node");
    }

    #[test]
    fn fragmented_allocation_spans_multiple_files() {
        let mut arena = PlacementArena::new(100);
        arena.extend_files(1);
        let _small = arena.alloc(60, id(1)).unwrap();
        arena.extend_files(1);

        // 40 bytes remain in file 0, plus the fresh 100-byte file 1:
        // a 120-byte request must fragment across both.
        let big = arena.alloc(120, id(2)).unwrap();
        let regions = arena.regions(big);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.iter().map(|r| r.length).sum::<u64>(), 120);
    }

    #[test]
    fn out_of_swap_when_insufficient() {
        let mut arena = PlacementArena::new(100);
        arena.extend_files(1);
        assert!(arena.alloc(1000, id(1)).is_err());
    }
}
