use comms_core::{Key, KeyType};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Delivery, MessageReceiver, ReceiverError, ReduceFunction};
use crate::prelude::*;
use crate::serialize::{Content, Payload};
use crate::types::CommsConfig;

pub type KeyedResults<T> = Arc<Mutex<BTreeMap<TaskId, IndexMap<Key, T>>>>;

/// Folds every value delivered to a target into the running value of its key.
pub struct KeyedReduceReceiver<T, F> {
    function: F,
    results: KeyedResults<T>,
    // Type of the raw keys of stored deliveries, set for keyed operations.
    key_type: Option<KeyType>,
}

impl<T, F: ReduceFunction<T>> KeyedReduceReceiver<T, F> {
    pub fn new(function: F) -> Self {
        Self {
            function,
            results: default(),
            key_type: None,
        }
    }

    /// Shared handle to the values reduced so far, per target and key.
    pub fn results(&self) -> KeyedResults<T> {
        Arc::clone(&self.results)
    }
}

impl<T, F> MessageReceiver<T> for KeyedReduceReceiver<T, F>
where
    T: Payload,
    F: ReduceFunction<T>,
{
    fn init(&mut self, config: &CommsConfig, expected: &BTreeMap<TaskId, Vec<TaskId>>) -> Result {
        if config.keyed {
            self.key_type = Some(config.key_type);
        }

        let mut results = self.results.lock();
        for &target in expected.keys() {
            results.entry(target).or_default();
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
        let key = match (delivery, self.key_type) {
            (Delivery::Content(Content::Keyed(key, _)), _) => key.clone(),
            (Delivery::Stored { key, .. }, Some(key_type)) => Key::from_bytes(key_type, key)?,
            _ => return Err(ReceiverError::MissingKey(source).into()),
        };
        let value = delivery.value()?;

        let mut results = self.results.lock();
        let values = results.entry(target).or_default();

        let reduced = match values.get(&key) {
            Some(current) => self.function.reduce(current, &value),
            None => value,
        };

        values.insert(key, reduced);
        Ok(true)
    }
}
