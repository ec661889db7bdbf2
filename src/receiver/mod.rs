//! Application side of an operation: receivers consume delivered messages, the streaming
//! reduce receivers combine them before handing them on.
mod gather;
mod keyed;
mod reduce;

pub use self::gather::GatherReceiver;
pub use self::keyed::KeyedReduceReceiver;
pub use self::reduce::{
    FinalReduceSink, ReduceFunction, ReduceReceiver, ReduceSink, ReduceStreamingReceiver,
    Reduction, RelaySink,
};

use comms_core::MessageHeader;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::prelude::*;
use crate::serialize::{Content, Payload};
use crate::store::OperationStore;
use crate::types::CommsConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("{0} is not a destination of this receiver")]
    UnknownTarget(TaskId),

    #[error("{target} does not expect values from {source_task}")]
    UnexpectedSource { source_task: TaskId, target: TaskId },

    #[error("message from {0} carries no key")]
    MissingKey(TaskId),

    #[error("operation store holds no value {position} for the delivered key")]
    MissingStoredValue { position: usize },
}

/// What a receiver is handed for one message.
#[derive(Debug, Clone)]
pub enum Delivery<T> {
    Content(Content<T>),
    /// Store based operations persist the message and only pass on where to find it.
    Stored {
        store: Arc<OperationStore>,
        key: Vec<u8>,
        position: usize,
    },
}

impl<T> Delivery<T> {
    pub fn content(&self) -> Option<&Content<T>> {
        match self {
            Delivery::Content(c) => Some(c),
            Delivery::Stored { .. } => None,
        }
    }
}

impl<T: Payload> Delivery<T> {
    /// The delivered value. Stored deliveries read it back from the operation store.
    pub fn value(&self) -> Result<T> {
        match self {
            Delivery::Content(c) => Ok(c.value().clone()),
            Delivery::Stored {
                store,
                key,
                position,
            } => store
                .get_value(key, *position)?
                .ok_or_else(|| ReceiverError::MissingStoredValue { position: *position }.into()),
        }
    }
}

/// Capability interface of everything that sits on top of an operation.
///
/// Every hook returns whether it accepted the message. Declining is backpressure: the
/// operation keeps the message and offers it again on a later `progress`.
pub trait MessageReceiver<T>: Send {
    /// Called once before the operation starts with the expected senders of every destination
    /// task placed on this executor.
    fn init(&mut self, _config: &CommsConfig, _expected: &BTreeMap<TaskId, Vec<TaskId>>) -> Result {
        Ok(())
    }

    /// Terminal delivery of a message from `source` to the local task `target`.
    fn on_message(
        &mut self,
        source: TaskId,
        path: i32,
        target: TaskId,
        flags: i32,
        delivery: &Delivery<T>,
    ) -> Result<bool>;

    /// Pass-through hook of multi stage pipelines, invoked before terminal delivery of every
    /// message that arrived through the transport.
    fn pass_downstream(&mut self, _header: &MessageHeader, _delivery: &Delivery<T>) -> bool {
        true
    }

    fn progress(&mut self) -> Result {
        Ok(())
    }
}
