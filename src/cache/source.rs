//! Live cache entries and the per-page intrusive lists through them.
//!
//! Every [`Source`] sits on one list per VRAM page its texture footprint or
//! CLUT row touches, so a write to any of those pages can destroy it in one
//! unlink per reference. Sources live in a slot arena and the lists are
//! threaded through each source's inline node array by index, which keeps
//! the O(1) unlink of a pointer-linked list without any back pointers.

use super::hash::HashCacheKey;
use super::{SourceKey, MAX_PAGE_REFS_PER_SOURCE, NUM_PAGES};

/// Handle to a live [`Source`]. Stays valid until an invalidation touches
/// one of the source's referenced pages, after which the slot may be reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SourceId(pub(super) u32);

/// Address of a single list node: the arena slot of the owning source plus
/// the node's index within that source's `page_refs` array.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) struct NodeRef {
    pub(super) source: u32,
    pub(super) slot: u8,
}

#[derive(Clone, Copy, Default, Debug)]
pub(super) struct ListNode {
    /// The page list this node is linked on. Only meaningful for slots
    /// below the owning source's `num_page_refs`.
    pub(super) page: u8,
    pub(super) prev: Option<NodeRef>,
    pub(super) next: Option<NodeRef>,
}

#[derive(Clone, Copy, Default)]
struct PageList {
    head: Option<NodeRef>,
    tail: Option<NodeRef>,
}

pub struct Source {
    pub key: SourceKey,
    pub(super) hash_key: HashCacheKey,
    pub(super) num_page_refs: u8,
    pub(super) page_refs: [ListNode; MAX_PAGE_REFS_PER_SOURCE],
}

impl Source {
    pub(super) fn new(key: SourceKey, hash_key: HashCacheKey) -> Self {
        Self {
            key,
            hash_key,
            num_page_refs: 0,
            page_refs: [ListNode::default(); MAX_PAGE_REFS_PER_SOURCE],
        }
    }

    /// How many distinct page lists this source is linked on.
    pub fn num_page_refs(&self) -> usize {
        self.num_page_refs as usize
    }
}

pub(super) struct SourceTable {
    slots: Vec<Option<Source>>,
    free: Vec<u32>,
    pages: [PageList; NUM_PAGES],
}

impl SourceTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pages: [PageList::default(); NUM_PAGES],
        }
    }

    pub fn head(&self, page: u8) -> Option<NodeRef> {
        self.pages[page as usize].head
    }

    pub fn get(&self, id: SourceId) -> &Source {
        match &self.slots[id.0 as usize] {
            Some(source) => source,
            None => unreachable!("stale source handle"),
        }
    }

    fn get_mut(&mut self, id: SourceId) -> &mut Source {
        match &mut self.slots[id.0 as usize] {
            Some(source) => source,
            None => unreachable!("stale source handle"),
        }
    }

    pub fn node(&self, nref: NodeRef) -> ListNode {
        self.get(SourceId(nref.source)).page_refs[nref.slot as usize]
    }

    fn node_mut(&mut self, nref: NodeRef) -> &mut ListNode {
        &mut self.get_mut(SourceId(nref.source)).page_refs[nref.slot as usize]
    }

    pub fn insert(&mut self, source: Source) -> SourceId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(source);
                SourceId(slot)
            }
            None => {
                self.slots.push(Some(source));
                SourceId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Free the arena slot. The source must already be unlinked from every
    /// page list.
    pub fn remove(&mut self, id: SourceId) -> Source {
        let source = match self.slots[id.0 as usize].take() {
            Some(source) => source,
            None => unreachable!("removing source twice"),
        };
        self.free.push(id.0);
        source
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Link `id` at the front of `page`'s list. Texture footprint pages go
    /// at the front so a key lookup on its primary page finds them before
    /// any CLUT-only participants. No-op if the source already references
    /// the page.
    pub fn link_front(&mut self, page: u8, id: SourceId) {
        let Some(nref) = self.new_node(page, id) else {
            return;
        };
        let head = self.pages[page as usize].head;
        match head {
            Some(old_head) => {
                self.node_mut(old_head).prev = Some(nref);
                self.pages[page as usize].head = Some(nref);
            }
            None => {
                self.pages[page as usize].head = Some(nref);
                self.pages[page as usize].tail = Some(nref);
            }
        }
        *self.node_mut(nref) = ListNode { page, prev: None, next: head };
    }

    /// Link `id` at the back of `page`'s list, for pages that only hold the
    /// source's CLUT row. No-op if the source already references the page.
    pub fn link_back(&mut self, page: u8, id: SourceId) {
        let Some(nref) = self.new_node(page, id) else {
            return;
        };
        let tail = self.pages[page as usize].tail;
        match tail {
            Some(old_tail) => {
                self.node_mut(old_tail).next = Some(nref);
                self.pages[page as usize].tail = Some(nref);
            }
            None => {
                self.pages[page as usize].head = Some(nref);
                self.pages[page as usize].tail = Some(nref);
            }
        }
        *self.node_mut(nref) = ListNode { page, prev: tail, next: None };
    }

    /// Claim the next node slot of `id` for `page`, or `None` when the page
    /// is already referenced.
    fn new_node(&mut self, page: u8, id: SourceId) -> Option<NodeRef> {
        let source = self.get(id);
        for i in 0..source.num_page_refs as usize {
            if source.page_refs[i].page == page {
                return None;
            }
        }

        let slot = source.num_page_refs;
        debug_assert!((slot as usize) < MAX_PAGE_REFS_PER_SOURCE);

        self.get_mut(id).num_page_refs += 1;
        Some(NodeRef { source: id.0, slot })
    }

    /// Move a node to the front of the page list it sits on.
    pub fn move_to_front(&mut self, nref: NodeRef) {
        let node = self.node(nref);
        let Some(prev) = node.prev else {
            // Already at the front.
            return;
        };

        self.node_mut(prev).next = node.next;
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.pages[node.page as usize].tail = node.prev,
        }

        let old_head = match self.pages[node.page as usize].head {
            Some(head) => head,
            None => unreachable!("node linked on an empty list"),
        };
        self.node_mut(old_head).prev = Some(nref);
        self.pages[node.page as usize].head = Some(nref);
        *self.node_mut(nref) = ListNode {
            page: node.page,
            prev: None,
            next: Some(old_head),
        };
    }

    /// Unlink every node of a source from its page list. Each node knows
    /// which list it sits on, so no page lookup is needed.
    pub fn unlink_all(&mut self, id: SourceId) {
        for slot in 0..self.get(id).num_page_refs {
            let node = self.node(NodeRef { source: id.0, slot });
            match node.prev {
                Some(prev) => self.node_mut(prev).next = node.next,
                None => self.pages[node.page as usize].head = node.next,
            }
            match node.next {
                Some(next) => self.node_mut(next).prev = node.prev,
                None => self.pages[node.page as usize].tail = node.prev,
            }
        }
    }

    #[cfg(test)]
    pub fn page_sources(&self, page: u8) -> Vec<SourceId> {
        let mut ids = Vec::new();
        let mut cur = self.pages[page as usize].head;
        while let Some(nref) = cur {
            ids.push(SourceId(nref.source));
            cur = self.node(nref).next;
        }
        ids
    }
}
