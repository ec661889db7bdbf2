use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Delivery, MessageReceiver};
use crate::prelude::*;
use crate::serialize::Payload;
use crate::types::CommsConfig;

pub type Gathered<T> = Arc<Mutex<BTreeMap<TaskId, Vec<(TaskId, T)>>>>;

/// Keeps every delivered value, per target, in arrival order together with its source.
pub struct GatherReceiver<T> {
    values: Gathered<T>,
    limit: Option<usize>,
}

impl<T> GatherReceiver<T> {
    pub fn new() -> Self {
        Self {
            values: default(),
            limit: None,
        }
    }

    /// Declines deliveries to a target that already holds `limit` values.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            values: default(),
            limit: Some(limit),
        }
    }

    pub fn values(&self) -> Gathered<T> {
        Arc::clone(&self.values)
    }
}

impl<T> Default for GatherReceiver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> MessageReceiver<T> for GatherReceiver<T> {
    fn init(&mut self, _config: &CommsConfig, expected: &BTreeMap<TaskId, Vec<TaskId>>) -> Result {
        let mut values = self.values.lock();
        for &target in expected.keys() {
            values.entry(target).or_default();
        }

        Ok(())
    }

    fn on_message(
        &mut self,
        source: TaskId,
        _path: i32,
        target: TaskId,
        _flags: i32,
        delivery: &Delivery<T>,
    ) -> Result<bool> {
        let mut values = self.values.lock();
        let gathered = values.entry(target).or_default();

        if self.limit.map_or(false, |limit| gathered.len() >= limit) {
            return Ok(false);
        }

        gathered.push((source, delivery.value()?));
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serialize::Content;

    #[test]
    fn test_limit_declines_full_targets() {
        let mut receiver = GatherReceiver::<u32>::with_limit(2);
        let gathered = receiver.values();
        let deliver = |receiver: &mut GatherReceiver<u32>, target: i32, v: u32| {
            receiver
                .on_message(TaskId(0), 0, TaskId(target), 0, &Delivery::Content(Content::Plain(v)))
                .unwrap()
        };

        assert!(deliver(&mut receiver, 1, 10));
        assert!(deliver(&mut receiver, 1, 11));
        assert!(!deliver(&mut receiver, 1, 12));

        // Other targets have their own limit.
        assert!(deliver(&mut receiver, 2, 20));

        let gathered = gathered.lock();
        assert_eq!(gathered[&TaskId(1)], vec![(TaskId(0), 10), (TaskId(0), 11)]);
        assert_eq!(gathered[&TaskId(2)], vec![(TaskId(0), 20)]);
    }
}
