//! Routing tables: which destinations of a send are reachable without crossing an executor
//! boundary and which executors have to be reached through the transport.
mod broadcast;
mod keyed;
mod load_balance;
mod partition;

pub use self::broadcast::BroadcastRouter;
pub use self::keyed::KeyedRouter;
pub use self::load_balance::LoadBalanceRouter;
pub use self::partition::PartitionRouter;

use comms_core::Key;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

use crate::prelude::*;
use crate::types::PlanError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("{task} is not a source of this operation on {executor}")]
    UnknownSource { task: TaskId, executor: ExecutorId },

    #[error("{0} is not a destination of this operation")]
    UnknownDestination(TaskId),

    #[error("operation has no destinations")]
    NoDestinations,

    #[error("broadcast requires exactly one source, found {0}")]
    BroadcastSources(usize),

    #[error("keyed reduce operations group by key and cannot be routed per task")]
    KeyedRouting,

    #[error("{0} operations do not support this kind of send")]
    Unsupported(&'static str),

    #[error("{0}")]
    Plan(#[from] PlanError),
}

/// Routing decision of a single send attempt. Immutable once computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingParameters {
    pub internal: SmallVec<[TaskId; 4]>,
    pub external: SmallVec<[ExecutorId; 4]>,
    /// Destination stamped into the message header; `None` delivers to every destination
    /// of the receiving executor.
    pub destination: Option<TaskId>,
}

/// Routing strategy of an operation, selected at construction time.
#[derive(Debug)]
pub enum Router {
    Broadcast(BroadcastRouter),
    Partition(PartitionRouter),
    LoadBalance(LoadBalanceRouter),
    KeyedReduce(KeyedRouter),
}

impl Router {
    pub fn name(&self) -> &'static str {
        match self {
            Router::Broadcast(_) => "broadcast",
            Router::Partition(_) => "partition",
            Router::LoadBalance(_) => "load-balance",
            Router::KeyedReduce(_) => "keyed-reduce",
        }
    }

    pub fn table(&self) -> &PartitionRouter {
        match self {
            Router::Broadcast(r) => r.table(),
            Router::Partition(r) => r,
            Router::LoadBalance(r) => r.table(),
            Router::KeyedReduce(r) => r.table(),
        }
    }

    pub fn internal_destinations(&self, source: TaskId) -> Result<&[TaskId], RoutingError> {
        match self {
            Router::KeyedReduce(r) => r.internal_destinations(source),
            _ => self.table().internal_destinations(source),
        }
    }

    pub fn external_destinations(&self, source: TaskId) -> Result<&[ExecutorId], RoutingError> {
        match self {
            Router::KeyedReduce(r) => r.external_destinations(source),
            _ => self.table().external_destinations(source),
        }
    }

    pub fn expected_senders_for_task(&self, task: TaskId) -> Vec<TaskId> {
        self.table().expected_senders_for_task(task)
    }

    pub fn expected_senders(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        self.table().expected_senders()
    }

    pub fn is_final_receiver_at(&self, executor: ExecutorId) -> bool {
        self.table().is_final_receiver_at(executor)
    }

    pub fn receiving_executors(&self) -> &BTreeSet<ExecutorId> {
        self.table().receiving_executors()
    }

    pub fn local_sources(&self) -> &BTreeSet<TaskId> {
        self.table().local_sources()
    }

    pub fn local_destinations(&self) -> &[TaskId] {
        self.table().local_destinations()
    }

    /// Routing decision for one send from `source`, optionally to a single `destination`.
    pub fn route(
        &self,
        source: TaskId,
        destination: Option<TaskId>,
    ) -> Result<RoutingParameters, RoutingError> {
        match (self, destination) {
            (Router::Broadcast(r), None) => r.route(source),
            (Router::Broadcast(_), Some(_)) => Err(RoutingError::Unsupported(self.name())),
            (Router::Partition(r), None) => r.route_all(source),
            (Router::Partition(r), Some(d)) => r.route_to(source, d),
            (Router::LoadBalance(r), None) => r.route(source),
            (Router::LoadBalance(r), Some(d)) => r.table().route_to(source, d),
            (Router::KeyedReduce(_), _) => Err(RoutingError::KeyedRouting),
        }
    }

    pub fn route_keyed(&self, source: TaskId, key: &Key) -> Result<RoutingParameters, RoutingError> {
        match self {
            Router::KeyedReduce(r) => r.route(source, key),
            _ => Err(RoutingError::Unsupported(self.name())),
        }
    }
}
