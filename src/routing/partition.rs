use smallvec::smallvec;
use std::collections::{BTreeMap, BTreeSet};

use super::{RoutingError, RoutingParameters};
use crate::prelude::*;
use crate::types::TaskPlan;

/// Placement derived routing table shared by every routing variant: splits destinations into
/// tasks placed on this executor and executors that have to be reached through the transport.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    plan: TaskPlan,
    sources: BTreeSet<TaskId>,
    destinations: BTreeSet<TaskId>,
    local_sources: BTreeSet<TaskId>,
    internal: Vec<TaskId>,
    external: Vec<ExecutorId>,
    receiving_executors: BTreeSet<ExecutorId>,
}

impl PartitionRouter {
    pub fn new(
        plan: TaskPlan,
        sources: BTreeSet<TaskId>,
        destinations: BTreeSet<TaskId>,
    ) -> Result<Self, RoutingError> {
        if destinations.is_empty() {
            return Err(RoutingError::NoDestinations);
        }

        let me = plan.this_executor();
        let mut internal = vec![];
        let mut external = BTreeSet::new();

        for &task in &destinations {
            let executor = plan.executor_of(task)?;
            if executor == me {
                internal.push(task);
            } else {
                external.insert(executor);
            }
        }

        let mut source_executors = BTreeSet::new();
        for &task in &sources {
            source_executors.insert(plan.executor_of(task)?);
        }

        // Traffic only arrives here when this executor hosts at least one destination.
        let receiving_executors = if internal.is_empty() {
            BTreeSet::new()
        } else {
            source_executors.into_iter().filter(|&e| e != me).collect()
        };

        let local_sources = plan.local_subset(&sources);

        debug!(
            "{} routing: local sources {:?}, internal {:?}, external {:?}, receiving from {:?}",
            me, local_sources, internal, external, receiving_executors
        );

        Ok(Self {
            plan,
            sources,
            destinations,
            local_sources,
            internal,
            external: external.into_iter().collect(),
            receiving_executors,
        })
    }

    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }

    pub fn sources(&self) -> &BTreeSet<TaskId> {
        &self.sources
    }

    pub fn destinations(&self) -> &BTreeSet<TaskId> {
        &self.destinations
    }

    pub fn local_sources(&self) -> &BTreeSet<TaskId> {
        &self.local_sources
    }

    pub fn local_destinations(&self) -> &[TaskId] {
        &self.internal
    }

    pub fn receiving_executors(&self) -> &BTreeSet<ExecutorId> {
        &self.receiving_executors
    }

    pub(super) fn check_source(&self, source: TaskId) -> Result<(), RoutingError> {
        if self.local_sources.contains(&source) {
            Ok(())
        } else {
            Err(RoutingError::UnknownSource {
                task: source,
                executor: self.plan.this_executor(),
            })
        }
    }

    pub fn internal_destinations(&self, source: TaskId) -> Result<&[TaskId], RoutingError> {
        self.check_source(source)?;
        Ok(&self.internal)
    }

    pub fn external_destinations(&self, source: TaskId) -> Result<&[ExecutorId], RoutingError> {
        self.check_source(source)?;
        Ok(&self.external)
    }

    pub fn expected_senders_for_task(&self, task: TaskId) -> Vec<TaskId> {
        if self.destinations.contains(&task) {
            self.sources.iter().copied().collect()
        } else {
            vec![]
        }
    }

    /// Expected senders of every destination placed on this executor.
    pub fn expected_senders(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        self.internal
            .iter()
            .map(|&t| (t, self.expected_senders_for_task(t)))
            .collect()
    }

    pub fn is_final_receiver_at(&self, executor: ExecutorId) -> bool {
        self.destinations
            .iter()
            .any(|&t| self.plan.executor_of(t) == Ok(executor))
    }

    /// Routes to every destination.
    pub fn route_all(&self, source: TaskId) -> Result<RoutingParameters, RoutingError> {
        self.check_source(source)?;

        Ok(RoutingParameters {
            internal: self.internal.iter().copied().collect(),
            external: self.external.iter().copied().collect(),
            destination: None,
        })
    }

    /// Routes to a single destination.
    pub fn route_to(
        &self,
        source: TaskId,
        destination: TaskId,
    ) -> Result<RoutingParameters, RoutingError> {
        self.check_source(source)?;

        if !self.destinations.contains(&destination) {
            return Err(RoutingError::UnknownDestination(destination));
        }

        let executor = self.plan.executor_of(destination)?;
        let params = if executor == self.plan.this_executor() {
            RoutingParameters {
                internal: smallvec![destination],
                external: smallvec![],
                destination: Some(destination),
            }
        } else {
            RoutingParameters {
                internal: smallvec![],
                external: smallvec![executor],
                destination: Some(destination),
            }
        };

        Ok(params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::test::{plan, tasks};

    #[test]
    fn test_partition_split() {
        // executor 0: tasks 0, 1; executor 1: tasks 2, 3; executor 2: task 4
        let router = PartitionRouter::new(plan(0), tasks(&[0, 2]), tasks(&[1, 3, 4])).unwrap();

        assert_eq!(router.internal_destinations(TaskId(0)).unwrap(), &[TaskId(1)]);
        assert_eq!(
            router.external_destinations(TaskId(0)).unwrap(),
            &[ExecutorId(1), ExecutorId(2)]
        );
        assert_eq!(router.local_sources().len(), 1);
        assert_eq!(
            router.receiving_executors().iter().collect::<Vec<_>>(),
            vec![&ExecutorId(1)]
        );

        // Task 2 is a source, but lives on another executor.
        assert!(matches!(
            router.internal_destinations(TaskId(2)),
            Err(RoutingError::UnknownSource { .. })
        ));

        assert_eq!(
            router.expected_senders_for_task(TaskId(3)),
            vec![TaskId(0), TaskId(2)]
        );
        assert!(router.expected_senders_for_task(TaskId(0)).is_empty());
        assert!(router.is_final_receiver_at(ExecutorId(2)));
    }

    #[test]
    fn test_route_to() {
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[1, 3])).unwrap();

        let local = router.route_to(TaskId(0), TaskId(1)).unwrap();
        assert_eq!(local.internal.as_slice(), &[TaskId(1)]);
        assert!(local.external.is_empty());

        let remote = router.route_to(TaskId(0), TaskId(3)).unwrap();
        assert!(remote.internal.is_empty());
        assert_eq!(remote.external.as_slice(), &[ExecutorId(1)]);
        assert_eq!(remote.destination, Some(TaskId(3)));

        assert_eq!(
            router.route_to(TaskId(0), TaskId(2)).unwrap_err(),
            RoutingError::UnknownDestination(TaskId(2))
        );
    }

    #[test]
    fn test_no_traffic_without_local_destinations() {
        let router = PartitionRouter::new(plan(2), tasks(&[0, 2]), tasks(&[1, 3])).unwrap();
        assert!(router.receiving_executors().is_empty());
        assert!(!router.is_final_receiver_at(ExecutorId(2)));
        assert!(router.expected_senders().is_empty());
    }
}
