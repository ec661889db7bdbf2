use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{PartitionRouter, RoutingError, RoutingParameters};
use crate::prelude::*;
use crate::types::TaskPlan;

/// Spreads the stream of each source round-robin over the destinations, in ascending task
/// order starting at the first destination.
#[derive(Debug)]
pub struct LoadBalanceRouter {
    table: PartitionRouter,
    destinations: Vec<TaskId>,
    cursors: HashMap<TaskId, AtomicUsize>,
}

impl LoadBalanceRouter {
    pub fn new(
        plan: TaskPlan,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
    ) -> Result<Self, RoutingError> {
        let table = PartitionRouter::new(plan, sources, destinations)?;
        let destinations = table.destinations().iter().copied().collect();
        let cursors = table
            .local_sources()
            .iter()
            .map(|&s| (s, AtomicUsize::new(0)))
            .collect();

        Ok(Self {
            table,
            destinations,
            cursors,
        })
    }

    pub fn table(&self) -> &PartitionRouter {
        &self.table
    }

    /// Picks the destination under the cursor of `source` and advances the cursor.
    pub fn next_destination(&self, source: TaskId) -> Result<TaskId, RoutingError> {
        let cursor = match self.cursors.get(&source) {
            Some(cursor) => cursor,
            None => {
                return Err(RoutingError::UnknownSource {
                    task: source,
                    executor: self.table.plan().this_executor(),
                })
            }
        };

        let n = self.destinations.len();
        let index = cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % n))
            .unwrap_or_else(|i| i);

        Ok(self.destinations[index])
    }

    pub fn route(&self, source: TaskId) -> Result<RoutingParameters, RoutingError> {
        let destination = self.next_destination(source)?;
        self.table.route_to(source, destination)
    }
}
