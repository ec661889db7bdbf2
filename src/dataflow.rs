//! Collectives: one routing strategy bound to one operation and its receiver.
use comms_core::Key;
use std::sync::Arc;
use std::time::Duration;

use crate::network::Transport;
use crate::operation::{DataFlowOperation, SendKey};
use crate::prelude::*;
use crate::receiver::MessageReceiver;
use crate::routing::{Router, RoutingError};
use crate::serialize::{check_key, Content, Payload};
use crate::store::StoreManager;
use crate::types::{CommsConfig, ConfigError};

pub struct DataFlow<T> {
    router: Router,
    operation: Arc<DataFlowOperation<T>>,
}

impl<T: Payload> DataFlow<T> {
    pub fn new(
        router: Router,
        config: CommsConfig,
        edge: EdgeId,
        mut receiver: Box<dyn MessageReceiver<T>>,
        transport: Arc<dyn Transport>,
        stores: Option<&StoreManager>,
    ) -> Result<Self> {
        let plan = router.table().plan();
        let final_receiver = router.is_final_receiver_at(plan.this_executor());

        receiver.init(&config, &router.expected_senders())?;

        let store = if config.store_based && final_receiver {
            let stores = stores.ok_or(ConfigError::MissingStoreDirectory)?;
            Some(stores.add_operation(edge)?)
        } else {
            None
        };

        debug!(
            "{} collective on {} (final receiver: {})",
            router.name(),
            edge,
            final_receiver
        );

        let operation = DataFlowOperation::init(
            config,
            plan,
            edge,
            router.receiving_executors(),
            final_receiver,
            receiver,
            router.local_sources(),
            router.local_destinations(),
            transport,
            store,
        )?;

        Ok(Self { router, operation })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn operation(&self) -> &Arc<DataFlowOperation<T>> {
        &self.operation
    }

    pub fn edge(&self) -> EdgeId {
        self.operation.edge()
    }

    /// Whether `content` from `source` can be queued right now. Runs before routing, so
    /// neither a full queue nor rejected content moves a load balancing cursor.
    fn check_send(&self, source: TaskId, key: SendKey, content: &Content<T>) -> Result<bool> {
        if !self.router.local_sources().contains(&source) {
            return Err(RoutingError::UnknownSource {
                task: source,
                executor: self.operation.executor(),
            }
            .into());
        }

        // Keyed reduce routing keeps no cursor and refuses un-keyed sends on its own.
        if !matches!(self.router, Router::KeyedReduce(_)) {
            let config = self.operation.config();
            check_key(content, config.keyed, config.key_type)?;
        }

        Ok(self.operation.can_send(key))
    }

    /// Sends `value` from `source` to the destinations chosen by the routing strategy.
    pub fn send(&self, source: TaskId, value: T, flags: i32) -> Result<bool> {
        let content = Content::Plain(value);
        if !self.check_send(source, SendKey::Source(source), &content)? {
            return Ok(false);
        }

        let routing = self.router.route(source, None)?;
        self.operation.send(source, content, flags, routing)
    }

    /// Sends `value` from `source` to the single task `destination`.
    pub fn send_to(
        &self,
        source: TaskId,
        value: T,
        flags: i32,
        destination: TaskId,
    ) -> Result<bool> {
        let content = Content::Plain(value);
        if !self.check_send(source, SendKey::Source(source), &content)? {
            return Ok(false);
        }

        let routing = self.router.route(source, Some(destination))?;
        self.operation.send(source, content, flags, routing)
    }

    /// Sends a keyed value. Keyed reduce collectives deliver it to the owner of `key`, other
    /// collectives route it like `send`.
    pub fn send_keyed(&self, source: TaskId, key: Key, value: T, flags: i32) -> Result<bool> {
        let content = Content::Keyed(key, value);
        if !self.check_send(source, SendKey::Source(source), &content)? {
            return Ok(false);
        }

        let routing = match (&self.router, content.key()) {
            (Router::KeyedReduce(_), Some(key)) => self.router.route_keyed(source, key)?,
            _ => self.router.route(source, None)?,
        };

        self.operation.send(source, content, flags, routing)
    }

    /// Sends a value produced by a receiver of an earlier stage.
    pub fn send_partial(&self, source: TaskId, value: T, flags: i32) -> Result<bool> {
        if let Router::LoadBalance(_) = self.router {
            return Err(RoutingError::Unsupported(self.router.name()).into());
        }

        let content = Content::Plain(value);
        if !self.check_send(source, SendKey::Partial(source), &content)? {
            return Ok(false);
        }

        let routing = self.router.route(source, None)?;
        self.operation
            .send_partial(source, content, flags, routing)
    }

    /// Advances the operation, then the receiver.
    pub fn progress(&self) -> Result {
        self.operation.progress()?;
        self.operation.progress_receiver()
    }

    pub fn in_flight(&self) -> usize {
        self.operation.in_flight()
    }

    pub fn close(&self, timeout: Duration) -> Result {
        self.operation.close(timeout)
    }
}
