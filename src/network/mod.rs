//! The transport collaborator of dataflow operations.
mod local;

pub use self::local::LocalNetwork;

use std::sync::Arc;

use crate::buffer::{Buffer, BufferPool};
use crate::prelude::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("{0} is not part of this network")]
    UnknownExecutor(ExecutorId),

    #[error("frame of {size} bytes does not fit in receive buffers of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },

    #[error("a receiver for {source_executor} on {edge} is already registered")]
    DuplicateReceiver {
        source_executor: ExecutorId,
        edge: EdgeId,
    },

    #[error("connection was closed")]
    Disconnected,
}

/// Invoked once all frames of a send have left the sender, or the send failed.
pub type SendCallback = Box<dyn FnOnce(Result<(), NetworkError>) + Send>;

/// Consumer of the buffers arriving from one peer on one edge. Buffers are taken from the pool
/// that was registered together with the listener.
pub trait ReceiveListener: Send + Sync {
    fn on_buffer_received(&self, source: ExecutorId, edge: EdgeId, buffer: Buffer) -> Result;
}

pub trait Transport: Send + Sync {
    fn executor(&self) -> ExecutorId;

    /// Queues `frames` for delivery to `target`. Returns `Ok(false)` when the transport cannot
    /// accept the send right now; `on_complete` is dropped without being called in that case.
    fn send_bytes(
        &self,
        target: ExecutorId,
        edge: EdgeId,
        frames: Arc<Vec<Buffer>>,
        on_complete: SendCallback,
    ) -> Result<bool, NetworkError>;

    fn register_receiver(
        &self,
        source: ExecutorId,
        edge: EdgeId,
        pool: Arc<BufferPool>,
        listener: Arc<dyn ReceiveListener>,
    ) -> Result<(), NetworkError>;

    /// Drives the transport. Transports with their own threads can leave this empty.
    fn progress(&self) -> Result {
        Ok(())
    }
}
