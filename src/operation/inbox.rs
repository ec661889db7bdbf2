use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

use super::{InMessage, OperationError};
use crate::buffer::{Buffer, BufferPool};
use crate::network::ReceiveListener;
use crate::prelude::*;
use crate::serialize::MessageDeserializer;

struct Peer {
    pool: Arc<BufferPool>,
    assembling: Mutex<Option<InMessage>>,
    complete: ArrayQueue<InMessage>,
}

/// Receiving end of an operation, registered with the transport for every peer. Buffers are
/// appended to the message currently assembled for their peer; complete messages wait here
/// until the operation deserializes them.
pub(crate) struct Inbox {
    edge: EdgeId,
    deserializer: MessageDeserializer,
    peers: HashMap<ExecutorId, Peer>,
}

impl Inbox {
    pub(crate) fn new<I>(
        edge: EdgeId,
        deserializer: MessageDeserializer,
        peers: I,
        buffer_count: usize,
        buffer_size: usize,
    ) -> Self
    where
        I: IntoIterator<Item = ExecutorId>,
    {
        // Every complete message holds at least one buffer of its peer's pool, so the queue
        // cannot hold more messages than the pool has buffers.
        let peers = peers
            .into_iter()
            .map(|peer| {
                let state = Peer {
                    pool: Arc::new(BufferPool::new(buffer_count, buffer_size)),
                    assembling: Mutex::new(None),
                    complete: ArrayQueue::new(max(buffer_count, 1)),
                };

                (peer, state)
            })
            .collect();

        Self {
            edge,
            deserializer,
            peers,
        }
    }

    fn peer(&self, id: ExecutorId) -> Result<&Peer, OperationError> {
        self.peers
            .get(&id)
            .ok_or(OperationError::UnexpectedPeer(id))
    }

    pub(crate) fn pool(&self, peer: ExecutorId) -> Option<&Arc<BufferPool>> {
        self.peers.get(&peer).map(|p| &p.pool)
    }

    pub(crate) fn has_complete(&self, peer: ExecutorId) -> bool {
        self.peers
            .get(&peer)
            .map_or(false, |p| !p.complete.is_empty())
    }

    pub(crate) fn pop_complete(&self, peer: ExecutorId) -> Option<InMessage> {
        self.peers.get(&peer)?.complete.pop()
    }

    /// Returns the buffers of a consumed message to the pool of its peer.
    pub(crate) fn release(&self, message: InMessage) -> Result {
        let peer = self.peer(message.peer())?;
        for buffer in message.into_buffers() {
            peer.pool.release(buffer)?;
        }

        Ok(())
    }

    /// Messages that arrived partially or completely but were not consumed yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.peers
            .values()
            .map(|p| p.complete.len() + p.assembling.lock().is_some() as usize)
            .sum()
    }
}

impl ReceiveListener for Inbox {
    fn on_buffer_received(&self, source: ExecutorId, edge: EdgeId, buffer: Buffer) -> Result {
        if edge != self.edge {
            return Err(OperationError::WrongEdge {
                expected: self.edge,
                found: edge,
            }
            .into());
        }

        let peer = self.peer(source)?;
        let mut assembling = peer.assembling.lock();

        if assembling.is_none() {
            let header = self.deserializer.build_header(&buffer)?;
            trace!("assembling message from {} ({})", header.source, source);
            *assembling = Some(InMessage::new(source, header));
        }

        let complete = match assembling.as_mut() {
            Some(message) => {
                message.add_buffer(buffer)?;
                message.is_complete()
            }
            None => false,
        };

        if complete {
            if let Some(message) = assembling.take() {
                peer.complete
                    .push(message)
                    .map_err(|_| OperationError::QueueOverflow("deserialize"))?;
            }
        }

        Ok(())
    }
}
