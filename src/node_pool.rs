// Distributed under the GNU Affero General Public License v3.0 or later.
// See accompanying file LICENSE or https://www.gnu.org/licenses/agpl-3.0.html for details.

//! Pool-backed doubly linked lists.
//!
//! Nodes live in a `Vec` arena and freed slots go on a free list, so building and
//! tearing down lists every frame does not touch the allocator once the pool has
//! warmed up. A node carries `L` independent link lanes and can sit in up to `L`
//! different lists at once.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Head of one list. Owned by whoever owns the list (a convex), not by the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListHead {
    first: Option<NodeId>,
    last: Option<NodeId>,
    len: usize,
}

impl ListHead {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct Node<T, const L: usize> {
    value: T,
    links: [Link; L],
}

#[derive(Debug)]
pub struct NodePool<T, const L: usize> {
    nodes: Vec<Option<Node<T, L>>>,
    free_list: Vec<NodeId>,
}

impl<T, const L: usize> Default for NodePool<T, L> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
        }
    }
}

impl<T, const L: usize> NodePool<T, L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, value: T) -> NodeId {
        let node = Node {
            value,
            links: [Link::default(); L],
        };

        if let Some(id) = self.free_list.pop() {
            self.nodes[id.index()] = Some(node);
            id
        } else {
            let id = NodeId(self.nodes.len() as u32);
            self.nodes.push(Some(node));
            id
        }
    }

    /// Returns the node's slot to the free list. The node must already be
    /// unlinked from every lane.
    pub fn free(&mut self, id: NodeId) -> Option<T> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        debug_assert!(
            node.links
                .iter()
                .all(|link| link.prev.is_none() && link.next.is_none()),
            "freeing a node that is still linked"
        );
        self.free_list.push(id);
        Some(node.value)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .map(|node| &mut node.value)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn push_back(&mut self, head: &mut ListHead, lane: usize, id: NodeId) {
        let old_last = head.last;
        if let Some(node) = self.node_mut(id) {
            node.links[lane] = Link {
                prev: old_last,
                next: None,
            };
        } else {
            return;
        }

        match old_last {
            Some(last) => {
                if let Some(node) = self.node_mut(last) {
                    node.links[lane].next = Some(id);
                }
            }
            None => head.first = Some(id),
        }
        head.last = Some(id);
        head.len += 1;
    }

    /// Unlinks `id` from the list `head` on `lane`. The node stays allocated.
    pub fn unlink(&mut self, head: &mut ListHead, lane: usize, id: NodeId) {
        let link = match self.node(id) {
            Some(node) => node.links[lane],
            None => return,
        };

        match link.prev {
            Some(prev) => {
                if let Some(node) = self.node_mut(prev) {
                    node.links[lane].next = link.next;
                }
            }
            None => head.first = link.next,
        }

        match link.next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.links[lane].prev = link.prev;
                }
            }
            None => head.last = link.prev,
        }

        if let Some(node) = self.node_mut(id) {
            node.links[lane] = Link::default();
        }
        head.len = head.len.saturating_sub(1);
    }

    pub fn iter<'a>(&'a self, head: &ListHead, lane: usize) -> ListIter<'a, T, L> {
        ListIter {
            pool: self,
            lane,
            current: head.first,
            remaining: head.len,
        }
    }

    /// Snapshot of the node ids in a list, for loops that modify the list.
    pub fn ids(&self, head: &ListHead, lane: usize) -> Vec<NodeId> {
        self.iter(head, lane).map(|(id, _)| id).collect()
    }

    fn node(&self, id: NodeId) -> Option<&Node<T, L>> {
        self.nodes.get(id.index()).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T, L>> {
        self.nodes.get_mut(id.index()).and_then(|slot| slot.as_mut())
    }
}

pub struct ListIter<'a, T, const L: usize> {
    pool: &'a NodePool<T, L>,
    lane: usize,
    current: Option<NodeId>,
    remaining: usize,
}

impl<'a, T, const L: usize> Iterator for ListIter<'a, T, L> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        // `remaining` bounds the walk even if a lane was corrupted into a cycle.
        if self.remaining == 0 {
            return None;
        }
        let id = self.current?;
        let node = self.pool.node(id)?;
        self.current = node.links[self.lane].next;
        self.remaining -= 1;
        Some((id, &node.value))
    }
}
