//! The three per-connection envelope queues.
//!
//! All envelopes of one connection live in a single arena; each queue is a
//! linked list threaded through that arena by index.  An [`EnvelopeId`]
//! names an arena slot together with the slot's generation, so a handle to
//! an envelope that has since been retired (and its slot reused) simply
//! stops matching.
//!
//! | Operation               | Cost |
//! |-------------------------|------|
//! | [`Queues::push_back`]   | O(1) |
//! | [`Queues::pop_front`]   | O(1) |
//! | [`Queues::remove`]      | O(1) |
//! | [`Queues::move_to_back`]| O(1) |
//!
//! Removing something that is not a member of the named queue returns
//! `None`.  Two code paths retiring the same envelope is expected, and the
//! second one must be a no-op.

use crate::envelope::Envelope;

/// Which of a connection's queues an envelope is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Submitted, not yet sequenced.
    Pending,
    /// Sequenced and sent (or about to be), not yet acknowledged.
    InFlight,
    /// Received ahead of the next expected serial.
    Reorder,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Pending, QueueKind::InFlight, QueueKind::Reorder];

    #[inline]
    fn index(self) -> usize {
        match self {
            QueueKind::Pending => 0,
            QueueKind::InFlight => 1,
            QueueKind::Reorder => 2,
        }
    }
}

/// Stable handle to an envelope in a [`Queues`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvelopeId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node {
    envelope: Envelope,
    queue: QueueKind,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Ends {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

/// Arena-backed FIFO queues.
#[derive(Debug, Default)]
pub struct Queues {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ends: [Ends; 3],
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.ends[kind.index()].len
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.ends[kind.index()].head.is_none()
    }

    /// Total envelopes across all three queues.
    pub fn total(&self) -> usize {
        self.ends.iter().map(|e| e.len).sum()
    }

    /// Append `envelope` to the tail of `kind`.
    pub fn push_back(&mut self, kind: QueueKind, envelope: Envelope) -> EnvelopeId {
        let node = Node {
            envelope,
            queue: kind,
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.link_back(index, kind);
        self.id_of(index)
    }

    /// Detach and return the oldest envelope of `kind`.
    pub fn pop_front(&mut self, kind: QueueKind) -> Option<Envelope> {
        let head = self.ends[kind.index()].head?;
        self.unlink(head);
        self.free_slot(head)
    }

    /// Detach `id` from `kind` and return its envelope.
    ///
    /// `None` when `id` is stale or currently belongs to another queue.
    pub fn remove(&mut self, kind: QueueKind, id: EnvelopeId) -> Option<Envelope> {
        if !self.contains(kind, id) {
            return None;
        }
        self.unlink(id.index);
        self.free_slot(id.index)
    }

    /// Move `id` from whatever queue holds it to the tail of `to`.
    ///
    /// Returns `false` for a stale handle.  The handle stays valid.
    pub fn move_to_back(&mut self, id: EnvelopeId, to: QueueKind) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.unlink(id.index);
        self.link_back(id.index, to);
        true
    }

    /// `true` when `id` is live and a member of `kind`.
    pub fn contains(&self, kind: QueueKind, id: EnvelopeId) -> bool {
        self.node(id).is_some_and(|n| n.queue == kind)
    }

    pub fn get(&self, id: EnvelopeId) -> Option<&Envelope> {
        self.node(id).map(|n| &n.envelope)
    }

    pub fn get_mut(&mut self, id: EnvelopeId) -> Option<&mut Envelope> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut().map(|n| &mut n.envelope)
    }

    pub fn front(&self, kind: QueueKind) -> Option<EnvelopeId> {
        self.ends[kind.index()].head.map(|i| self.id_of(i))
    }

    /// Successor of `id` within its queue.
    pub fn next(&self, id: EnvelopeId) -> Option<EnvelopeId> {
        self.node(id)?.next.map(|i| self.id_of(i))
    }

    /// Iterate over `kind` from head to tail.
    pub fn iter(&self, kind: QueueKind) -> Iter<'_> {
        Iter {
            queues: self,
            cursor: self.ends[kind.index()].head,
        }
    }

    /// Snapshot of the handles in `kind`, for traversals that retire
    /// members as they go.
    pub fn ids(&self, kind: QueueKind) -> Vec<EnvelopeId> {
        self.iter(kind).map(|(id, _)| id).collect()
    }

    /// Pop every envelope of `kind`, oldest first.
    pub fn drain(&mut self, kind: QueueKind) -> impl Iterator<Item = Envelope> + '_ {
        std::iter::from_fn(move || self.pop_front(kind))
    }

    // -----------------------------------------------------------------------
    // Link maintenance
    // -----------------------------------------------------------------------

    fn id_of(&self, index: u32) -> EnvelopeId {
        EnvelopeId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn node(&self, id: EnvelopeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_at_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.slots
            .get_mut(index as usize)
            .and_then(|s| s.node.as_mut())
    }

    fn link_back(&mut self, index: u32, kind: QueueKind) {
        let tail = self.ends[kind.index()].tail;
        if let Some(node) = self.node_at_mut(index) {
            node.queue = kind;
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(t) => {
                if let Some(prev) = self.node_at_mut(t) {
                    prev.next = Some(index);
                }
            }
            None => self.ends[kind.index()].head = Some(index),
        }
        let ends = &mut self.ends[kind.index()];
        ends.tail = Some(index);
        ends.len += 1;
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next, kind) = match self.node_at_mut(index) {
            Some(n) => {
                let links = (n.prev, n.next, n.queue);
                n.prev = None;
                n.next = None;
                links
            }
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_at_mut(p) {
                    n.next = next;
                }
            }
            None => self.ends[kind.index()].head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_at_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.ends[kind.index()].tail = prev,
        }
        self.ends[kind.index()].len -= 1;
    }

    fn free_slot(&mut self, index: u32) -> Option<Envelope> {
        let slot = self.slots.get_mut(index as usize)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(node.envelope)
    }
}

/// Head-to-tail iterator over one queue.
pub struct Iter<'a> {
    queues: &'a Queues,
    cursor: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EnvelopeId, &'a Envelope);

    fn next(&mut self) -> Option<Self::Item> {
        let queues: &'a Queues = self.queues;
        let index = self.cursor?;
        let slot = queues.slots.get(index as usize)?;
        let node = slot.node.as_ref()?;
        self.cursor = node.next;
        Some((
            EnvelopeId {
                index,
                generation: slot.generation,
            },
            &node.envelope,
        ))
    }
}
