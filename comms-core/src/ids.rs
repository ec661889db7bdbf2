use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Smallest addressable compute unit that sources or sinks messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i32);

/// Process-level placement unit hosting one or more tasks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutorId(pub i32);

/// Logical channel separating the traffic of one dataflow operation from another.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub i32);

impl TaskId {
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl ExecutorId {
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl EdgeId {
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

impl Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor{}", self.0)
    }
}

impl Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge{}", self.0)
    }
}
