use std::collections::{BTreeMap, VecDeque};
use std::ops::{Add, Mul};
use std::sync::Arc;

use super::{Delivery, MessageReceiver, ReceiverError};
use crate::dataflow::DataFlow;
use crate::prelude::*;
use crate::serialize::Payload;
use crate::types::CommsConfig;

/// Associative combination of two values.
pub trait ReduceFunction<T>: Send {
    fn reduce(&self, left: &T, right: &T) -> T;
}

impl<T, F> ReduceFunction<T> for F
where
    F: Fn(&T, &T) -> T + Send,
{
    fn reduce(&self, left: &T, right: &T) -> T {
        (self)(left, right)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Reduction {
    Sum,
    Product,
    Min,
    Max,
}

impl<T> ReduceFunction<T> for Reduction
where
    T: Copy + PartialOrd + Add<Output = T> + Mul<Output = T>,
{
    fn reduce(&self, left: &T, right: &T) -> T {
        use Reduction::*;
        let (l, r) = (*left, *right);

        match self {
            Sum => l + r,
            Product => l * r,
            Min => {
                if r < l {
                    r
                } else {
                    l
                }
            }
            Max => {
                if r > l {
                    r
                } else {
                    l
                }
            }
        }
    }
}

/// Application consumer of fully reduced values.
pub trait ReduceReceiver<T>: Send {
    fn receive(&mut self, target: TaskId, value: T) -> bool;
}

/// Where a streaming reduce hands its combined values.
pub trait ReduceSink<T>: Send {
    /// Offers one combined value for `target`. Declining keeps the inputs buffered.
    fn on_reduced(&mut self, target: TaskId, flags: i32, value: T) -> Result<bool>;
}

/// Sink of the last stage, handing results to the application.
#[derive(Debug)]
pub struct FinalReduceSink<R>(pub R);

impl<T, R: ReduceReceiver<T>> ReduceSink<T> for FinalReduceSink<R> {
    fn on_reduced(&mut self, target: TaskId, _flags: i32, value: T) -> Result<bool> {
        Ok(self.0.receive(target, value))
    }
}

/// Sink of an intermediate stage, forwarding combined values into the next collective with the
/// reducing task as source.
pub struct RelaySink<T> {
    next: Arc<DataFlow<T>>,
}

impl<T> RelaySink<T> {
    pub fn new(next: Arc<DataFlow<T>>) -> Self {
        Self { next }
    }
}

impl<T: Payload> ReduceSink<T> for RelaySink<T> {
    fn on_reduced(&mut self, target: TaskId, flags: i32, value: T) -> Result<bool> {
        self.next.send_partial(target, value, flags)
    }
}

/// Combines, per target, one value of every expected source into a single value as soon as
/// every source has contributed.
pub struct ReduceStreamingReceiver<T, F, S> {
    function: F,
    sink: S,
    limit: usize,
    messages: BTreeMap<TaskId, IndexMap<TaskId, VecDeque<T>>>,
    flags: BTreeMap<TaskId, i32>,
}

impl<T, F, S> ReduceStreamingReceiver<T, F, S>
where
    F: ReduceFunction<T>,
    S: ReduceSink<T>,
{
    pub fn new(function: F, sink: S) -> Self {
        Self {
            function,
            sink,
            limit: CommsConfig::default().send_pending_max,
            messages: default(),
            flags: default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Values buffered for `target` from `source`.
    pub fn pending(&self, target: TaskId, source: TaskId) -> usize {
        self.messages
            .get(&target)
            .and_then(|sources| sources.get(&source))
            .map_or(0, VecDeque::len)
    }

    fn combine(&self, queues: &IndexMap<TaskId, VecDeque<T>>) -> Option<T>
    where
        T: Clone,
    {
        let mut heads = queues.values().map(VecDeque::front);
        let mut result = heads.next()??.clone();

        for head in heads {
            result = self.function.reduce(&result, head?);
        }

        Some(result)
    }
}

impl<T, F, S> MessageReceiver<T> for ReduceStreamingReceiver<T, F, S>
where
    T: Payload,
    F: ReduceFunction<T>,
    S: ReduceSink<T>,
{
    fn init(&mut self, config: &CommsConfig, expected: &BTreeMap<TaskId, Vec<TaskId>>) -> Result {
        self.limit = config.send_pending_max;
        self.messages = expected
            .iter()
            .map(|(&target, sources)| {
                let queues = sources.iter().map(|&s| (s, VecDeque::new())).collect();
                (target, queues)
            })
            .collect();

        debug!("streaming reduce expects {:?}", expected);
        Ok(())
    }

    fn on_message(
        &mut self,
        source: TaskId,
        _path: i32,
        target: TaskId,
        flags: i32,
        delivery: &Delivery<T>,
    ) -> Result<bool> {
        let queue = self
            .messages
            .get_mut(&target)
            .ok_or(ReceiverError::UnknownTarget(target))?
            .get_mut(&source)
            .ok_or(ReceiverError::UnexpectedSource {
                source_task: source,
                target,
            })?;

        if queue.len() >= self.limit {
            return Ok(false);
        }

        queue.push_back(delivery.value()?);
        self.flags.insert(target, flags);
        Ok(true)
    }

    fn progress(&mut self) -> Result {
        let targets = self.messages.keys().copied().collect_vec();

        for target in targets {
            loop {
                let value = match self.messages.get(&target).and_then(|q| self.combine(q)) {
                    Some(v) => v,
                    None => break,
                };

                let flags = self.flags.get(&target).copied().unwrap_or(0);
                if !self.sink.on_reduced(target, flags, value)? {
                    break;
                }

                trace!("reduced one round for {}", target);
                if let Some(queues) = self.messages.get_mut(&target) {
                    for queue in queues.values_mut() {
                        queue.pop_front();
                    }
                }
            }
        }

        Ok(())
    }
}
