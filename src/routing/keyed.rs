use comms_core::Key;
use std::collections::BTreeSet;

use super::{PartitionRouter, RoutingError, RoutingParameters};
use crate::prelude::*;
use crate::types::TaskPlan;

/// Keyed reduce: values are grouped by key, so there is no per-task route. Each key is owned
/// by one destination, chosen from a stable hash of the key.
#[derive(Debug, Clone)]
pub struct KeyedRouter {
    table: PartitionRouter,
    destinations: Vec<TaskId>,
}

impl KeyedRouter {
    pub fn new(
        plan: TaskPlan,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
    ) -> Result<Self, RoutingError> {
        let table = PartitionRouter::new(plan, sources, destinations)?;
        let destinations = table.destinations().iter().copied().collect();
        Ok(Self {
            table,
            destinations,
        })
    }

    pub fn table(&self) -> &PartitionRouter {
        &self.table
    }

    pub fn internal_destinations(&self, _source: TaskId) -> Result<&[TaskId], RoutingError> {
        Err(RoutingError::KeyedRouting)
    }

    pub fn external_destinations(&self, _source: TaskId) -> Result<&[ExecutorId], RoutingError> {
        Err(RoutingError::KeyedRouting)
    }

    pub fn owner_of(&self, key: &Key) -> TaskId {
        let index = fxhash::hash64(key) % self.destinations.len() as u64;
        self.destinations[index as usize]
    }

    pub fn route(&self, source: TaskId, key: &Key) -> Result<RoutingParameters, RoutingError> {
        self.table.route_to(source, self.owner_of(key))
    }
}
