use comms_core::{MessageHeader, HEADER_SIZE};
use std::sync::Arc;

use super::OperationError;
use crate::buffer::Buffer;
use crate::prelude::*;
use crate::receiver::Delivery;

/// Message arriving from a peer, assembled from the buffers it was split into.
#[derive(Debug)]
pub struct InMessage {
    peer: ExecutorId,
    header: MessageHeader,
    buffers: Vec<Buffer>,
    received: usize,
}

impl InMessage {
    pub fn new(peer: ExecutorId, header: MessageHeader) -> Self {
        Self {
            peer,
            header,
            buffers: vec![],
            received: 0,
        }
    }

    pub fn peer(&self) -> ExecutorId {
        self.peer
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Payload bytes received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        !self.buffers.is_empty() && self.received == self.header.length
    }

    /// Appends the next buffer of this message. The first buffer starts with the header.
    pub fn add_buffer(&mut self, buffer: Buffer) -> Result<(), OperationError> {
        let payload = if self.buffers.is_empty() {
            buffer.size().saturating_sub(HEADER_SIZE)
        } else {
            buffer.size()
        };

        if self.is_complete() || self.received + payload > self.header.length {
            return Err(OperationError::MessageOverflow {
                source_task: self.header.source,
                length: self.header.length,
                found: self.received + payload,
            });
        }

        self.received += payload;
        self.buffers.push(buffer);
        Ok(())
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received);
        for (i, buffer) in enumerate(&self.buffers) {
            let skip = if i == 0 { HEADER_SIZE } else { 0 };
            out.extend_from_slice(&buffer.as_slice()[skip..]);
        }

        out
    }

    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ReceiveState {
    Init,
    Down,
    Receive,
}

/// Deserialized message waiting to be handed to the receiver.
pub(crate) struct ReceiveEntry<T> {
    pub(crate) header: MessageHeader,
    pub(crate) delivery: Delivery<T>,
    pub(crate) message: Option<InMessage>,
    pub(crate) state: ReceiveState,
    pub(crate) next_target: usize,
}

impl<T> ReceiveEntry<T> {
    pub(crate) fn new(
        header: MessageHeader,
        delivery: Delivery<T>,
        message: Option<InMessage>,
    ) -> Self {
        Self {
            header,
            delivery,
            message,
            state: ReceiveState::Init,
            next_target: 0,
        }
    }

    pub(crate) fn advance(&mut self, state: ReceiveState) {
        assert!(state > self.state);
        trace!(
            "message from {}: {:?} -> {:?}",
            self.header.source,
            self.state,
            state
        );
        self.state = state;
    }
}

/// Serialized message handed to the transport. The buffers go back to the send pool once
/// every transport send of the message completed.
#[derive(Debug)]
pub(crate) struct OutMessage {
    pub(crate) frames: Arc<Vec<Buffer>>,
    pub(crate) outstanding: usize,
    pub(crate) sealed: bool,
}

impl OutMessage {
    pub(crate) fn new(frames: Arc<Vec<Buffer>>) -> Self {
        Self {
            frames,
            outstanding: 0,
            sealed: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.sealed && self.outstanding == 0
    }
}
