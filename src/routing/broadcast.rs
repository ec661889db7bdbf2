use std::collections::BTreeSet;

use super::{PartitionRouter, RoutingError, RoutingParameters};
use crate::prelude::*;
use crate::types::TaskPlan;

/// A single source whose payload reaches every destination.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    table: PartitionRouter,
    root: TaskId,
}

impl BroadcastRouter {
    pub fn new(
        plan: TaskPlan,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
    ) -> Result<Self, RoutingError> {
        let root = match sources.iter().next() {
            Some(&root) if sources.len() == 1 => root,
            _ => return Err(RoutingError::BroadcastSources(sources.len())),
        };

        let table = PartitionRouter::new(plan, sources, destinations)?;
        Ok(Self { table, root })
    }

    pub fn table(&self) -> &PartitionRouter {
        &self.table
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    pub fn route(&self, source: TaskId) -> Result<RoutingParameters, RoutingError> {
        self.table.route_all(source)
    }
}
