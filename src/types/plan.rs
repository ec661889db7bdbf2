use std::collections::{BTreeMap, BTreeSet};

use crate::prelude::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("{0} is not placed on any executor")]
    UnknownTask(TaskId),
}

/// Placement of tasks onto executors, as seen from one executor.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    this_executor: ExecutorId,
    placement: BTreeMap<TaskId, ExecutorId>,
}

impl TaskPlan {
    pub fn new<I>(this_executor: ExecutorId, placement: I) -> Self
    where
        I: IntoIterator<Item = (TaskId, ExecutorId)>,
    {
        Self {
            this_executor,
            placement: placement.into_iter().collect(),
        }
    }

    /// The same placement seen from another executor.
    pub fn for_executor(&self, executor: ExecutorId) -> Self {
        Self {
            this_executor: executor,
            placement: self.placement.clone(),
        }
    }

    pub fn this_executor(&self) -> ExecutorId {
        self.this_executor
    }

    pub fn executor_of(&self, task: TaskId) -> Result<ExecutorId, PlanError> {
        self.placement
            .get(&task)
            .copied()
            .ok_or(PlanError::UnknownTask(task))
    }

    pub fn is_local(&self, task: TaskId) -> bool {
        self.placement.get(&task) == Some(&self.this_executor)
    }

    pub fn tasks_of(&self, executor: ExecutorId) -> BTreeSet<TaskId> {
        self.placement
            .iter()
            .filter(|&(_, &e)| e == executor)
            .map(|(&t, _)| t)
            .collect()
    }

    pub fn tasks_of_this_executor(&self) -> BTreeSet<TaskId> {
        self.tasks_of(self.this_executor)
    }

    /// Members of `tasks` placed on this executor.
    pub fn local_subset<'a, I>(&self, tasks: I) -> BTreeSet<TaskId>
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        tasks
            .into_iter()
            .copied()
            .filter(|&t| self.is_local(t))
            .collect()
    }

    pub fn executors(&self) -> BTreeSet<ExecutorId> {
        self.placement.values().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_task_plan() {
        let plan = TaskPlan::new(
            ExecutorId(1),
            vec![
                (TaskId(0), ExecutorId(0)),
                (TaskId(1), ExecutorId(1)),
                (TaskId(2), ExecutorId(1)),
            ],
        );

        assert!(plan.is_local(TaskId(2)));
        assert!(!plan.is_local(TaskId(0)));
        assert!(!plan.is_local(TaskId(9)));
        assert_eq!(plan.executor_of(TaskId(0)), Ok(ExecutorId(0)));
        assert_eq!(
            plan.executor_of(TaskId(9)),
            Err(PlanError::UnknownTask(TaskId(9)))
        );

        let local: Vec<_> = plan.tasks_of_this_executor().into_iter().collect();
        assert_eq!(local, vec![TaskId(1), TaskId(2)]);

        let subset = plan.local_subset(&[TaskId(0), TaskId(2)]);
        assert_eq!(subset.into_iter().collect::<Vec<_>>(), vec![TaskId(2)]);

        let other = plan.for_executor(ExecutorId(0));
        assert!(other.is_local(TaskId(0)));
        assert_eq!(other.executors().len(), 2);
    }
}
