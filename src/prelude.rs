pub use comms_core::prelude::*;
pub use comms_core::{EdgeId, ExecutorId, TaskId};
