//! Page-hash index: (object, offset) to resident page.
//!
//! One table shared by every object. Nodes refer to their object by [`ObjectId`] only,
//! so the index never keeps an object alive. Mutations happen under the owning object's
//! lock; the table lock itself is a leaf.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::PAGE_SHIFT;
use crate::{FrameNumber, Page};

/// Identity of a VM object within the page-hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

/// Low bit of a node's offset; set for pager-private nodes.
pub const OFFSET_TYPE_MASK: u64 = 1;

/// What a node's handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A resident data page.
    Page = 0,
    /// State owned by the pager (e.g. a backing-store slot for a paged-out page).
    Pager = 1,
}

/// A binding of (object, offset) to a resident page or pager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PghashNode {
    object: ObjectId,
    offset: u64,
    handle: usize,
}

impl PghashNode {
    /// A node for a resident page.
    pub fn page(object: ObjectId, offset: u64, page: Page) -> Self {
        Self::new(object, NodeKind::Page, offset, page.addr())
    }

    /// A node of either kind. `offset` must be even; its low bit carries the kind.
    pub fn new(object: ObjectId, kind: NodeKind, offset: u64, handle: usize) -> Self {
        assert_eq!(offset & OFFSET_TYPE_MASK, 0, "odd page-hash offset {offset:#x}");
        Self {
            object,
            offset: offset | kind as u64,
            handle,
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// The offset with the type bit masked off.
    pub fn offset(&self) -> u64 {
        self.offset & !OFFSET_TYPE_MASK
    }

    /// The offset as stored, type bit included.
    pub fn tagged_offset(&self) -> u64 {
        self.offset
    }

    pub fn kind(&self) -> NodeKind {
        match self.offset & OFFSET_TYPE_MASK {
            0 => NodeKind::Page,
            _ => NodeKind::Pager,
        }
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    /// The resident page of a [`NodeKind::Page`] node.
    pub fn resident(&self) -> Option<Page> {
        match self.kind() {
            NodeKind::Page => Some(Page::from_frame(FrameNumber::new(self.handle))),
            NodeKind::Pager => None,
        }
    }

    fn matches(&self, object: ObjectId, offset: u64) -> bool {
        self.object == object && self.offset() == offset & !OFFSET_TYPE_MASK
    }
}

/// The page-hash table.
pub struct PageHash {
    buckets: spin::RwLock<Box<[Vec<PghashNode>]>>,
    mask: u64,
    next_id: AtomicU64,
}

impl PageHash {
    /// Creates a table with `buckets` buckets (a power of two).
    pub fn new(buckets: usize) -> Self {
        assert!(buckets.is_power_of_two(), "bucket count must be a power of two");
        Self {
            buckets: spin::RwLock::new((0..buckets).map(|_| Vec::new()).collect()),
            mask: buckets as u64 - 1,
            next_id: AtomicU64::new(1),
        }
    }

    /// Sizes the table at one bucket per `2^shift` pages of memory.
    pub fn for_memory(total_bytes: usize, shift: usize) -> Self {
        let pages = total_bytes >> PAGE_SHIFT;
        let buckets = (pages >> shift).max(1).next_power_of_two();
        log::debug!("pghash: {} buckets for {} pages", buckets, pages);
        Self::new(buckets)
    }

    /// Allocates a fresh object identity.
    pub fn new_object_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn bucket(&self, object: ObjectId, offset: u64) -> usize {
        let hash = object.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (offset >> PAGE_SHIFT);
        (hash & self.mask) as usize
    }

    /// Inserts a node.
    ///
    /// # Panics
    ///
    /// Panics if a node already exists for the node's (object, offset).
    pub fn add(&self, node: PghashNode) {
        let index = self.bucket(node.object, node.offset());
        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[index];
        assert!(
            !bucket.iter().any(|n| n.matches(node.object, node.offset)),
            "page-hash: duplicate node for {:?} offset {:#x}",
            node.object,
            node.offset()
        );
        bucket.push(node);
    }

    /// Removes the node for (object, offset) and returns it.
    ///
    /// # Panics
    ///
    /// Panics if no such node exists.
    pub fn remove(&self, object: ObjectId, offset: u64) -> PghashNode {
        let index = self.bucket(object, offset);
        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[index];
        match bucket.iter().position(|n| n.matches(object, offset)) {
            Some(pos) => bucket.swap_remove(pos),
            None => panic!("page-hash: no node for {object:?} offset {offset:#x}"),
        }
    }

    /// Moves the node for (`old`, offset) to `new`, keeping its offset and tag.
    ///
    /// Both bucket updates happen under one write lock, so a concurrent lookup finds
    /// the node under exactly one of the two objects.
    pub fn migrate(&self, old: ObjectId, offset: u64, new: ObjectId) -> PghashNode {
        let from = self.bucket(old, offset);
        let to = self.bucket(new, offset);
        let mut buckets = self.buckets.write();

        let pos = match buckets[from].iter().position(|n| n.matches(old, offset)) {
            Some(pos) => pos,
            None => panic!("page-hash: migrating missing node {old:?} offset {offset:#x}"),
        };
        assert!(
            !buckets[to].iter().any(|n| n.matches(new, offset)),
            "page-hash: migration target {new:?} already has offset {offset:#x}"
        );
        let mut node = buckets[from].swap_remove(pos);
        node.object = new;
        buckets[to].push(node);
        node
    }

    pub fn lookup(&self, object: ObjectId, offset: u64) -> Option<PghashNode> {
        let index = self.bucket(object, offset);
        self.buckets.read()[index]
            .iter()
            .find(|n| n.matches(object, offset))
            .copied()
    }

    /// Number of nodes in the table.
    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;
    use proptest::prelude::*;

    fn page(n: usize) -> Page {
        Page::from_frame(FrameNumber::new(n))
    }

    #[test]
    fn add_and_lookup() {
        let hash = PageHash::new(4);
        let a = hash.new_object_id();
        let offset = 3 * PAGE_SIZE as u64;
        hash.add(PghashNode::page(a, offset, page(9)));

        let node = hash.lookup(a, offset).unwrap();
        assert_eq!(node.resident(), Some(page(9)));
        assert_eq!(node.kind(), NodeKind::Page);
        assert!(hash.lookup(a, 0).is_none());
        assert!(hash.lookup(hash.new_object_id(), offset).is_none());
    }

    #[test]
    fn type_tag_round_trips() {
        let hash = PageHash::new(4);
        let a = hash.new_object_id();
        let b = hash.new_object_id();
        let offset = 2 * PAGE_SIZE as u64;
        hash.add(PghashNode::new(a, NodeKind::Pager, offset, 77));

        let node = hash.lookup(a, offset | 1).unwrap();
        assert_eq!(node.tagged_offset(), offset | 1);
        assert_eq!(node.offset(), offset);
        assert_eq!(node.resident(), None);

        let moved = hash.migrate(a, offset, b);
        assert_eq!(moved.tagged_offset(), offset | 1);
        assert_eq!(hash.lookup(b, offset).map(|n| n.handle()), Some(77));
    }

    #[test]
    fn migrate_moves_between_objects() {
        let hash = PageHash::new(8);
        let (a, b) = (hash.new_object_id(), hash.new_object_id());
        hash.add(PghashNode::page(a, 0, page(1)));

        hash.migrate(a, 0, b);
        assert!(hash.lookup(a, 0).is_none());
        assert_eq!(hash.lookup(b, 0).map(|n| n.object()), Some(b));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate node")]
    fn double_insert_is_fatal() {
        let hash = PageHash::new(2);
        let a = hash.new_object_id();
        hash.add(PghashNode::page(a, 0, page(1)));
        hash.add(PghashNode::page(a, 0, page(2)));
    }

    #[test]
    #[should_panic(expected = "no node")]
    fn removing_missing_node_is_fatal() {
        let hash = PageHash::new(2);
        hash.remove(hash.new_object_id(), 0);
    }

    #[test]
    fn concurrent_lookups_see_node_exactly_once() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let hash = Arc::new(PageHash::new(16));
        let (a, b) = (hash.new_object_id(), hash.new_object_id());
        hash.add(PghashNode::page(a, 0, page(5)));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let (hash, stop) = (hash.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let buckets = hash.buckets.read();
                    let seen = buckets
                        .iter()
                        .flatten()
                        .filter(|n| n.offset() == 0 && (n.object() == a || n.object() == b))
                        .count();
                    assert_eq!(seen, 1);
                }
            })
        };
        for _ in 0..1000 {
            hash.migrate(a, 0, b);
            hash.migrate(b, 0, a);
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    proptest! {
        #[test]
        fn at_most_one_node_per_key(
            keys in prop::collection::vec((0u64..4, 0u64..16), 1..64)
        ) {
            let hash = PageHash::new(8);
            let mut present = std::collections::BTreeSet::new();
            for (object, index) in keys {
                let (object, offset) = (ObjectId(object), index * PAGE_SIZE as u64);
                if present.insert((object, offset)) {
                    hash.add(PghashNode::page(object, offset, page(index as usize)));
                } else {
                    hash.remove(object, offset);
                    present.remove(&(object, offset));
                }
                prop_assert_eq!(hash.len(), present.len());
                for &(o, off) in &present {
                    prop_assert!(hash.lookup(o, off).is_some());
                }
            }
        }
    }
}
