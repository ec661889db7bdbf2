use crossbeam::queue::SegQueue;
use slotmap::new_key_type;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::prelude::*;
use crate::receiver::Delivery;
use crate::routing::RoutingParameters;
use crate::serialize::{Content, SerializeState};

new_key_type! {
    /// Handle of an outbound message in the arena of its operation.
    pub struct MessageId;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SendState {
    Init,
    SentInternally,
    Serialized,
    Finished,
}

/// Queue a send is placed on. Partial sends of streaming receivers get a queue of their own
/// next to the regular queue of each source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SendKey {
    Source(TaskId),
    Partial(TaskId),
}

impl SendKey {
    pub fn task(self) -> TaskId {
        match self {
            SendKey::Source(t) | SendKey::Partial(t) => t,
        }
    }
}

impl Display for SendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendKey::Source(t) => write!(f, "{}", t),
            SendKey::Partial(t) => write!(f, "{} (partial)", t),
        }
    }
}

/// Everything needed to move one object to its destinations, plus how far that got.
#[derive(Debug)]
pub struct SendDescriptor {
    pub source: TaskId,
    pub edge: EdgeId,
    pub path: i32,
    pub flags: i32,
    pub routing: RoutingParameters,
    state: SendState,
    pub(crate) accepted_internal: usize,
    pub(crate) accepted_external: usize,
    pub(crate) serialize_state: Option<SerializeState>,
    pub(crate) buffers: Vec<Buffer>,
    pub(crate) outbound: Option<(MessageId, Arc<Vec<Buffer>>)>,
}

impl SendDescriptor {
    pub fn new(
        source: TaskId,
        edge: EdgeId,
        path: i32,
        flags: i32,
        routing: RoutingParameters,
    ) -> Self {
        Self {
            source,
            edge,
            path,
            flags,
            routing,
            state: SendState::Init,
            accepted_internal: 0,
            accepted_external: 0,
            serialize_state: None,
            buffers: vec![],
            outbound: None,
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SendState) {
        assert!(
            state >= self.state,
            "send from {} cannot move back from {:?} to {:?}",
            self.source,
            self.state,
            state
        );

        trace!("send from {}: {:?} -> {:?}", self.source, self.state, state);
        self.state = state;
    }
}

pub(crate) struct PendingSend<T> {
    pub(crate) content: Content<T>,
    pub(crate) local: Option<Delivery<T>>,
    pub(crate) descriptor: SendDescriptor,
}

/// Bounded FIFO of the sends of one key. Producers reserve a slot before pushing, and a slot
/// is only given back once its entry finished, including the entry currently being worked on.
pub(crate) struct SendQueue<T> {
    entries: SegQueue<PendingSend<T>>,
    reserved: AtomicUsize,
    capacity: usize,
}

impl<T> SendQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: SegQueue::new(),
            reserved: AtomicUsize::new(0),
            capacity,
        }
    }

    pub(crate) fn try_reserve(&self) -> bool {
        let capacity = self.capacity;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.reserved.load(Ordering::SeqCst) < self.capacity
    }

    /// Pushes into a slot obtained from `try_reserve`.
    pub(crate) fn push(&self, entry: PendingSend<T>) {
        self.entries.push(entry);
    }

    pub(crate) fn pop(&self) -> Option<PendingSend<T>> {
        self.entries.pop()
    }

    pub(crate) fn finish_one(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Entries that have not finished yet.
    pub(crate) fn len(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }
}
