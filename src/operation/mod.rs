//! The per-edge engine moving objects from local sources to local and remote destinations.
mod inbox;
mod message;
mod send;

pub use self::message::InMessage;
pub use self::send::{MessageId, SendDescriptor, SendKey, SendState};

use crossbeam::channel::{self, Receiver, Sender};
use slotmap::SlotMap;
use smallvec::{smallvec, SmallVec};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use self::inbox::Inbox;
use self::message::{OutMessage, ReceiveEntry, ReceiveState};
use self::send::{PendingSend, SendQueue};
use crate::buffer::BufferPool;
use crate::network::{NetworkError, SendCallback, Transport};
use crate::prelude::*;
use crate::progress::ProgressTracker;
use crate::receiver::{Delivery, MessageReceiver};
use crate::routing::{RoutingError, RoutingParameters};
use crate::serialize::{check_key, Content, MessageDeserializer, MessageSerializer, Payload};
use crate::store::OperationStore;
use crate::types::{CommsConfig, ConfigError, TaskPlan, DEFAULT_PATH};

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("no send queue for {0} in this operation")]
    UnknownSendKey(SendKey),

    #[error("operation on {0} is closed")]
    Closed(EdgeId),

    #[error("operation on {edge} failed earlier: {reason}")]
    Failed { edge: EdgeId, reason: String },

    #[error("{remaining} messages still in flight when closing operation on {edge}")]
    InFlightOnClose { edge: EdgeId, remaining: usize },

    #[error("message from {source_task} declares {length} payload bytes, received {found}")]
    MessageOverflow {
        source_task: TaskId,
        length: usize,
        found: usize,
    },

    #[error("received data from {0}, which does not send to this operation")]
    UnexpectedPeer(ExecutorId),

    #[error("received message for {0}, which is not a destination on this executor")]
    UnexpectedDestination(TaskId),

    #[error("received buffer on {found}, expected {expected}")]
    WrongEdge { expected: EdgeId, found: EdgeId },

    #[error("{0} queue accepted more entries than its capacity")]
    QueueOverflow(&'static str),

    #[error("transport belongs to {transport}, placement plan to {plan}")]
    ExecutorMismatch {
        transport: ExecutorId,
        plan: ExecutorId,
    },
}

type Completion = (MessageId, Result<(), NetworkError>);

struct ProgressState<T> {
    send_heads: HashMap<SendKey, PendingSend<T>>,
    receive_queues: HashMap<ExecutorId, VecDeque<ReceiveEntry<T>>>,
    outbound: SlotMap<MessageId, OutMessage>,
}

/// Stateful engine of one edge on one executor.
///
/// `send` only enqueues. All other work happens in `progress`, which must be called repeatedly
/// by the owner of the operation. Each call advances at most one send queue, one deserialize
/// queue and one receive queue, rotating through the queues that have work.
pub struct DataFlowOperation<T> {
    edge: EdgeId,
    executor: ExecutorId,
    config: CommsConfig,
    final_receiver: bool,
    local_destinations: Vec<TaskId>,
    transport: Arc<dyn Transport>,
    send_pool: Arc<BufferPool>,
    serializer: MessageSerializer,
    deserializer: MessageDeserializer,
    send_queues: HashMap<SendKey, SendQueue<T>>,
    send_tracker: ProgressTracker<SendKey>,
    deserialize_tracker: ProgressTracker<ExecutorId>,
    receive_tracker: ProgressTracker<ExecutorId>,
    inbox: Arc<Inbox>,
    state: Mutex<ProgressState<T>>,
    receiver: Mutex<Box<dyn MessageReceiver<T>>>,
    completions: (Sender<Completion>, Receiver<Completion>),
    store: Option<Arc<OperationStore>>,
    closed: AtomicBool,
    // First fatal error seen by `progress`. A failed operation accepts no more work.
    failure: Mutex<Option<String>>,
}

impl<T: Payload> DataFlowOperation<T> {
    /// Sets up queues and pools and registers with the transport for every executor in
    /// `receiving_executors`. `receiver` must already be initialized.
    pub fn init(
        config: CommsConfig,
        plan: &TaskPlan,
        edge: EdgeId,
        receiving_executors: &BTreeSet<ExecutorId>,
        final_receiver: bool,
        receiver: Box<dyn MessageReceiver<T>>,
        sources: &BTreeSet<TaskId>,
        local_destinations: &[TaskId],
        transport: Arc<dyn Transport>,
        store: Option<Arc<OperationStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let executor = plan.this_executor();
        if transport.executor() != executor {
            return Err(OperationError::ExecutorMismatch {
                transport: transport.executor(),
                plan: executor,
            }
            .into());
        }

        if config.store_based && final_receiver && store.is_none() {
            return Err(ConfigError::MissingStoreDirectory.into());
        }

        let mut send_keys = vec![];
        for &task in sources {
            if !plan.is_local(task) {
                return Err(RoutingError::UnknownSource { task, executor }.into());
            }

            send_keys.push(SendKey::Source(task));
            send_keys.push(SendKey::Partial(task));
        }

        let send_queues = send_keys
            .iter()
            .map(|&key| (key, SendQueue::new(config.send_pending_max)))
            .collect();

        let deserializer = MessageDeserializer::new(config.keyed, config.key_type);
        let inbox = Arc::new(Inbox::new(
            edge,
            deserializer,
            receiving_executors.iter().copied(),
            config.receive_buffer_count,
            config.receive_buffer_size,
        ));

        for &peer in receiving_executors {
            let pool = inbox
                .pool(peer)
                .cloned()
                .ok_or(OperationError::UnexpectedPeer(peer))?;
            transport.register_receiver(peer, edge, pool, inbox.clone())?;
        }

        debug!(
            "{} initialized operation on {}: sources {:?}, destinations {:?}, peers {:?}",
            executor, edge, sources, local_destinations, receiving_executors
        );

        Ok(Arc::new(Self {
            edge,
            executor,
            final_receiver,
            local_destinations: local_destinations.to_vec(),
            transport,
            send_pool: Arc::new(BufferPool::new(
                config.send_buffer_count,
                config.send_buffer_size,
            )),
            serializer: MessageSerializer::new(config.keyed, config.key_type),
            deserializer,
            send_queues,
            send_tracker: ProgressTracker::new(send_keys),
            deserialize_tracker: ProgressTracker::new(receiving_executors.iter().copied()),
            receive_tracker: ProgressTracker::new(receiving_executors.iter().copied()),
            inbox,
            state: Mutex::new(ProgressState {
                send_heads: default(),
                receive_queues: default(),
                outbound: SlotMap::with_key(),
            }),
            receiver: Mutex::new(receiver),
            completions: channel::unbounded(),
            store,
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
            config,
        }))
    }

    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    pub fn executor(&self) -> ExecutorId {
        self.executor
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn send_pool(&self) -> &BufferPool {
        &self.send_pool
    }

    pub fn receive_pool(&self, peer: ExecutorId) -> Option<&BufferPool> {
        self.inbox.pool(peer).map(|p| &**p)
    }

    pub fn store(&self) -> Option<&Arc<OperationStore>> {
        self.store.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    fn check_failed(&self) -> Result<(), OperationError> {
        match &*self.failure.lock() {
            Some(reason) => Err(OperationError::Failed {
                edge: self.edge,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Queues `content` from `source`. `Ok(false)` means the queue of `source` is full.
    pub fn send(
        &self,
        source: TaskId,
        content: Content<T>,
        flags: i32,
        routing: RoutingParameters,
    ) -> Result<bool> {
        self.enqueue(SendKey::Source(source), content, flags, routing)
    }

    /// Like `send`, for values produced by a receiver partway through a pipeline.
    pub fn send_partial(
        &self,
        source: TaskId,
        content: Content<T>,
        flags: i32,
        routing: RoutingParameters,
    ) -> Result<bool> {
        self.enqueue(SendKey::Partial(source), content, flags, routing)
    }

    pub fn can_send(&self, key: SendKey) -> bool {
        self.send_queues
            .get(&key)
            .map_or(false, SendQueue::has_capacity)
    }

    fn enqueue(
        &self,
        key: SendKey,
        content: Content<T>,
        flags: i32,
        routing: RoutingParameters,
    ) -> Result<bool> {
        if self.is_closed() {
            return Err(OperationError::Closed(self.edge).into());
        }

        self.check_failed()?;

        let queue = self
            .send_queues
            .get(&key)
            .ok_or(OperationError::UnknownSendKey(key))?;

        check_key(&content, self.config.keyed, self.config.key_type)?;

        if !queue.try_reserve() {
            return Ok(false);
        }

        trace!("queued send from {} on {}: {:?}", key, self.edge, routing);
        queue.push(PendingSend {
            content,
            local: None,
            descriptor: SendDescriptor::new(key.task(), self.edge, DEFAULT_PATH, flags, routing),
        });

        Ok(true)
    }

    /// Advances pending work. Returns immediately when another thread is already inside
    /// `progress`.
    ///
    /// An error is fatal: the operation drops all queued work and every later `send` or
    /// `progress` fails with `OperationError::Failed`.
    pub fn progress(&self) -> Result {
        if self.is_closed() {
            return Ok(());
        }

        let mut guard = match self.state.try_lock() {
            Some(guard) => guard,
            None => return Ok(()),
        };
        let state = &mut *guard;

        if let Err(e) = self.check_failed() {
            // Transfers issued before the failure still hand their buffers back.
            self.reclaim_outbound(state)?;
            return Err(e.into());
        }

        let result = self.progress_queues(state);
        if let Err(e) = &result {
            self.fail(state, e);
        }

        result
    }

    fn progress_queues(&self, state: &mut ProgressState<T>) -> Result {
        self.reclaim_outbound(state)?;

        if let Some(key) = next_with_work(&self.send_tracker, |k| self.send_queues[k].len() > 0)
        {
            let result = self.progress_send(state, key);
            self.send_tracker.finish(key);
            result?;
        }

        if let Some(peer) = next_with_work(&self.deserialize_tracker, |p| {
            self.inbox.has_complete(*p)
        }) {
            let result = self.progress_deserialize(state, peer);
            self.deserialize_tracker.finish(peer);
            result?;
        }

        if let Some(peer) = next_with_work(&self.receive_tracker, |p| {
            state.receive_queues.get(p).map_or(false, |q| !q.is_empty())
        }) {
            let result = self.progress_receive(state, peer);
            self.receive_tracker.finish(peer);
            result?;
        }

        Ok(())
    }

    /// Runs `progress` of the receiver, unless the receiver is busy with a delivery.
    pub fn progress_receiver(&self) -> Result {
        self.check_failed()?;

        match self.receiver.try_lock() {
            Some(mut receiver) => receiver.progress(),
            None => Ok(()),
        }
    }

    fn progress_send(&self, state: &mut ProgressState<T>, key: SendKey) -> Result {
        let queue = &self.send_queues[&key];
        let ProgressState {
            send_heads,
            outbound,
            ..
        } = state;

        // FIFO: stop at the first entry that cannot finish during this call.
        loop {
            let mut pending = match send_heads.remove(&key).or_else(|| queue.pop()) {
                Some(p) => p,
                None => break,
            };

            match self.advance_send(&mut pending, outbound) {
                Ok(true) => queue.finish_one(),
                Ok(false) => {
                    send_heads.insert(key, pending);
                    break;
                }
                Err(e) => {
                    self.discard_send(pending, outbound);
                    queue.finish_one();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn advance_send(
        &self,
        pending: &mut PendingSend<T>,
        outbound: &mut SlotMap<MessageId, OutMessage>,
    ) -> Result<bool> {
        let PendingSend {
            content,
            local,
            descriptor: send,
        } = pending;

        if send.state() == SendState::Init {
            if !self.deliver_internally(content, local, send)? {
                return Ok(false);
            }

            send.set_state(SendState::SentInternally);
        }

        if send.routing.external.is_empty() {
            send.set_state(SendState::Finished);
            return Ok(true);
        }

        if send.state() == SendState::SentInternally
            && self.serializer.build(content, send, &self.send_pool)? != SendState::Serialized
        {
            return Ok(false);
        }

        let (id, frames) = match send.outbound.take() {
            Some(entry) => entry,
            None => {
                let frames = Arc::new(take(&mut send.buffers));
                let id = outbound.insert(OutMessage::new(Arc::clone(&frames)));
                (id, frames)
            }
        };

        while let Some(&target) = send.routing.external.get(send.accepted_external) {
            let completions = self.completions.0.clone();
            let on_complete: SendCallback = Box::new(move |result| {
                let _ = completions.send((id, result));
            });

            let accepted =
                self.transport
                    .send_bytes(target, self.edge, Arc::clone(&frames), on_complete);

            match accepted {
                Ok(true) => {}
                Ok(false) => {
                    send.outbound = Some((id, frames));
                    return Ok(false);
                }
                Err(e) => {
                    send.outbound = Some((id, frames));
                    return Err(e.into());
                }
            }

            if let Some(message) = outbound.get_mut(id) {
                message.outstanding += 1;
            }
            send.accepted_external += 1;
        }

        if let Some(message) = outbound.get_mut(id) {
            message.sealed = true;
        }

        send.set_state(SendState::Finished);
        Ok(true)
    }

    fn deliver_internally(
        &self,
        content: &Content<T>,
        local: &mut Option<Delivery<T>>,
        send: &mut SendDescriptor,
    ) -> Result<bool> {
        if send.accepted_internal >= send.routing.internal.len() {
            return Ok(true);
        }

        if local.is_none() {
            *local = Some(self.local_delivery(content, send.source)?);
        }

        let delivery = match local.as_ref() {
            Some(d) => d,
            None => return Ok(false),
        };

        while let Some(&target) = send.routing.internal.get(send.accepted_internal) {
            let accepted = self.receiver.lock().on_message(
                send.source,
                send.path,
                target,
                send.flags,
                delivery,
            )?;

            if !accepted {
                return Ok(false);
            }

            send.accepted_internal += 1;
        }

        Ok(true)
    }

    fn local_delivery(&self, content: &Content<T>, source: TaskId) -> Result<Delivery<T>> {
        match &self.store {
            Some(store) if self.final_receiver => {
                let (key, value) = self.serializer.encode_key_value(content, source)?;
                let position = store.append(&key, &value)?;

                Ok(Delivery::Stored {
                    store: Arc::clone(store),
                    key,
                    position,
                })
            }
            _ => Ok(Delivery::Content(content.clone())),
        }
    }

    fn progress_deserialize(&self, state: &mut ProgressState<T>, peer: ExecutorId) -> Result {
        let queue = state.receive_queues.entry(peer).or_default();
        if queue.len() >= self.config.receive_buffer_count {
            return Ok(());
        }

        let message = match self.inbox.pop_complete(peer) {
            Some(m) => m,
            None => return Ok(()),
        };

        let header = *message.header();
        let entry = match &self.store {
            Some(store) if self.final_receiver => {
                let stored = self
                    .deserializer
                    .extract_key_value(&message)
                    .map_err(Error::from)
                    .and_then(|(key, value)| Ok((store.append(&key, &value)?, key)));
                self.inbox.release(message)?;
                let (position, key) = stored?;

                let delivery = Delivery::Stored {
                    store: Arc::clone(store),
                    key,
                    position,
                };
                ReceiveEntry::new(header, delivery, None)
            }
            _ => {
                let content = match self.deserializer.build(&message) {
                    Ok(content) => content,
                    Err(e) => {
                        self.inbox.release(message)?;
                        return Err(e.into());
                    }
                };
                ReceiveEntry::new(header, Delivery::Content(content), Some(message))
            }
        };

        trace!("deserialized message from {} ({})", header.source, peer);
        queue.push_back(entry);
        Ok(())
    }

    fn progress_receive(&self, state: &mut ProgressState<T>, peer: ExecutorId) -> Result {
        let queue = match state.receive_queues.get_mut(&peer) {
            Some(q) => q,
            None => return Ok(()),
        };

        while let Some(entry) = queue.front_mut() {
            if !self.deliver(entry)? {
                break;
            }

            if let Some(entry) = queue.pop_front() {
                if let Some(message) = entry.message {
                    self.inbox.release(message)?;
                }
            }
        }

        Ok(())
    }

    fn deliver(&self, entry: &mut ReceiveEntry<T>) -> Result<bool> {
        if entry.state == ReceiveState::Init {
            entry.advance(ReceiveState::Down);
        }

        if entry.state == ReceiveState::Down {
            if !self
                .receiver
                .lock()
                .pass_downstream(&entry.header, &entry.delivery)
            {
                return Ok(false);
            }

            entry.advance(ReceiveState::Receive);
        }

        let targets: SmallVec<[TaskId; 4]> = match entry.header.destination {
            Some(d) if self.local_destinations.contains(&d) => smallvec![d],
            Some(d) => return Err(OperationError::UnexpectedDestination(d).into()),
            None => self.local_destinations.iter().copied().collect(),
        };

        while let Some(&target) = targets.get(entry.next_target) {
            let accepted = self.receiver.lock().on_message(
                entry.header.source,
                DEFAULT_PATH,
                target,
                entry.header.flags,
                &entry.delivery,
            )?;

            if !accepted {
                return Ok(false);
            }

            entry.next_target += 1;
        }

        Ok(true)
    }

    /// Gives the buffers of outbound messages back to the send pool once the transport is done
    /// with them.
    fn reclaim_outbound(&self, state: &mut ProgressState<T>) -> Result {
        for (id, result) in self.completions.1.try_iter() {
            if let Err(e) = result {
                warn!("send on {} failed: {}", self.edge, e);
            }

            match state.outbound.get_mut(id) {
                Some(message) if message.outstanding > 0 => message.outstanding -= 1,
                _ => warn!("unexpected send completion on {}", self.edge),
            }
        }

        let done = state
            .outbound
            .iter()
            .filter(|(_, m)| m.is_done() && Arc::strong_count(&m.frames) == 1)
            .map(|(id, _)| id)
            .collect_vec();

        for id in done {
            let message = match state.outbound.remove(id) {
                Some(m) => m,
                None => continue,
            };

            match Arc::try_unwrap(message.frames) {
                Ok(buffers) => {
                    for buffer in buffers {
                        self.send_pool.release(buffer)?;
                    }
                }
                Err(_) => warn!("buffers of a finished send on {} are still shared", self.edge),
            }
        }

        Ok(())
    }

    /// Drops a send that will never finish, giving its buffers back to the pool.
    fn discard_send(
        &self,
        pending: PendingSend<T>,
        outbound: &mut SlotMap<MessageId, OutMessage>,
    ) {
        let mut send = pending.descriptor;
        for buffer in take(&mut send.buffers) {
            if let Err(e) = self.send_pool.release(buffer) {
                warn!("cannot release send buffer on {}: {}", self.edge, e);
            }
        }

        // The arena entry is reclaimed once the transfers already accepted complete.
        if let Some((id, frames)) = send.outbound.take() {
            drop(frames);
            if let Some(message) = outbound.get_mut(id) {
                message.sealed = true;
            }
        }
    }

    /// Records the first fatal error and drops all queued work.
    fn fail(&self, state: &mut ProgressState<T>, error: &Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                return;
            }

            *failure = Some(error.to_string());
        }

        error!("operation on {} failed: {}", self.edge, error);

        for (key, pending) in take(&mut state.send_heads) {
            self.discard_send(pending, &mut state.outbound);
            self.send_queues[&key].finish_one();
        }

        for queue in self.send_queues.values() {
            while let Some(pending) = queue.pop() {
                self.discard_send(pending, &mut state.outbound);
                queue.finish_one();
            }
        }

        for (_, queue) in state.receive_queues.drain() {
            for entry in queue {
                if let Some(message) = entry.message {
                    if let Err(e) = self.inbox.release(message) {
                        warn!("cannot release receive buffers on {}: {}", self.edge, e);
                    }
                }
            }
        }

        if let Err(e) = self.reclaim_outbound(state) {
            warn!("cannot reclaim send buffers on {}: {}", self.edge, e);
        }
    }

    /// Number of sends, messages and transport transfers that have not completed yet.
    pub fn in_flight(&self) -> usize {
        let queued: usize = self.send_queues.values().map(SendQueue::len).sum();
        let state = self.state.lock();
        let receiving: usize = state.receive_queues.values().map(VecDeque::len).sum();

        queued + receiving + state.outbound.len() + self.inbox.in_flight()
    }

    /// Drives the operation until nothing is in flight or `timeout` passed, then stops all
    /// scheduling. Work left at that point is reported as an error.
    pub fn close(&self, timeout: Duration) -> Result {
        if self.is_closed() {
            return Ok(());
        }

        let drained = self.drive_until(Instant::now() + timeout);
        self.closed.store(true, Ordering::SeqCst);
        drained?;

        let remaining = self.in_flight();
        if remaining > 0 {
            return Err(OperationError::InFlightOnClose {
                edge: self.edge,
                remaining,
            }
            .into());
        }

        debug!("{} closed operation on {}", self.executor, self.edge);
        Ok(())
    }

    fn drive_until(&self, deadline: Instant) -> Result {
        self.check_failed()?;

        while self.in_flight() > 0 && Instant::now() < deadline {
            self.transport.progress()?;
            self.progress()?;
            self.progress_receiver()?;
            thread::yield_now();
        }

        Ok(())
    }
}

/// Takes the next key from `tracker` whose queue has work, visiting every key at most once.
fn next_with_work<K, F>(tracker: &ProgressTracker<K>, has_work: F) -> Option<K>
where
    F: Fn(&K) -> bool,
{
    for _ in 0..tracker.len() {
        let key = tracker.next()?;
        if has_work(&key) {
            return Some(key);
        }

        tracker.finish(key);
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::{LocalNetwork, ReceiveListener};
    use crate::routing::test::{plan, tasks};
    use crate::routing::PartitionRouter;
    use crate::store::StoreManager;
    use comms_core::MessageHeader;

    type Received = Vec<(TaskId, TaskId, Option<Vec<u32>>)>;

    #[derive(Clone, Default)]
    struct Recorder {
        received: Arc<Mutex<Received>>,
        declined: Arc<Mutex<Option<TaskId>>>,
        passed: Arc<Mutex<usize>>,
        // Number of upcoming `pass_downstream` calls to decline.
        decline_down: Arc<Mutex<usize>>,
    }

    impl Recorder {
        fn values(&self) -> Vec<(TaskId, TaskId, Option<Vec<u32>>)> {
            self.received.lock().clone()
        }
    }

    impl MessageReceiver<Vec<u32>> for Recorder {
        fn on_message(
            &mut self,
            source: TaskId,
            _path: i32,
            target: TaskId,
            _flags: i32,
            delivery: &Delivery<Vec<u32>>,
        ) -> Result<bool> {
            match *self.declined.lock() {
                Some(t) if t == target => return Ok(false),
                _ => {}
            }

            let value = delivery.content().map(|c| c.value().clone());
            self.received.lock().push((source, target, value));
            Ok(true)
        }

        fn pass_downstream(
            &mut self,
            _header: &MessageHeader,
            _delivery: &Delivery<Vec<u32>>,
        ) -> bool {
            let mut declines = self.decline_down.lock();
            if *declines > 0 {
                *declines -= 1;
                return false;
            }

            *self.passed.lock() += 1;
            true
        }
    }

    /// Forwards to a `LocalNetwork` until it is broken, then fails every send.
    struct FlakyTransport {
        inner: LocalNetwork,
        broken: AtomicBool,
    }

    impl Transport for FlakyTransport {
        fn executor(&self) -> ExecutorId {
            self.inner.executor()
        }

        fn send_bytes(
            &self,
            target: ExecutorId,
            edge: EdgeId,
            frames: Arc<Vec<crate::buffer::Buffer>>,
            on_complete: SendCallback,
        ) -> Result<bool, NetworkError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(NetworkError::Disconnected);
            }

            self.inner.send_bytes(target, edge, frames, on_complete)
        }

        fn register_receiver(
            &self,
            source: ExecutorId,
            edge: EdgeId,
            pool: Arc<BufferPool>,
            listener: Arc<dyn ReceiveListener>,
        ) -> Result<(), NetworkError> {
            self.inner.register_receiver(source, edge, pool, listener)
        }

        fn progress(&self) -> Result {
            self.inner.progress()
        }
    }

    fn small_config() -> CommsConfig {
        CommsConfig {
            send_buffer_count: 4,
            send_buffer_size: 48,
            receive_buffer_count: 4,
            receive_buffer_size: 48,
            send_pending_max: 2,
            ..default()
        }
    }

    fn operation(
        config: CommsConfig,
        router: &PartitionRouter,
        network: &LocalNetwork,
        receiver: &Recorder,
        store: Option<Arc<OperationStore>>,
    ) -> Arc<DataFlowOperation<Vec<u32>>> {
        operation_on(config, router, Arc::new(network.clone()), receiver, store)
    }

    fn operation_on(
        config: CommsConfig,
        router: &PartitionRouter,
        transport: Arc<dyn Transport>,
        receiver: &Recorder,
        store: Option<Arc<OperationStore>>,
    ) -> Arc<DataFlowOperation<Vec<u32>>> {
        DataFlowOperation::init(
            config,
            router.plan(),
            EdgeId(1),
            router.receiving_executors(),
            router.is_final_receiver_at(transport.executor()),
            Box::new(receiver.clone()),
            router.local_sources(),
            router.local_destinations(),
            transport,
            store,
        )
        .unwrap()
    }

    fn drive(operations: &[&Arc<DataFlowOperation<Vec<u32>>>], network: &[LocalNetwork]) {
        for _ in 0..200 {
            for n in network {
                n.progress().unwrap();
            }

            for op in operations {
                op.progress().unwrap();
            }

            if operations.iter().all(|op| op.in_flight() == 0) {
                return;
            }
        }

        panic!("operations did not drain");
    }

    #[test]
    fn test_backpressure_round_trip() {
        let network = LocalNetwork::cluster(1, 4);
        let plan = TaskPlan::new(
            ExecutorId(0),
            vec![(TaskId(0), ExecutorId(0)), (TaskId(1), ExecutorId(0))],
        );
        let router = PartitionRouter::new(plan, tasks(&[0]), tasks(&[1])).unwrap();
        let receiver = Recorder::default();
        let op = operation(small_config(), &router, &network[0], &receiver, None);

        let send = |v: u32| {
            let routing = router.route_all(TaskId(0)).unwrap();
            op.send(TaskId(0), Content::Plain(vec![v]), 0, routing)
                .unwrap()
        };

        assert!(send(1));
        assert!(send(2));
        assert!(!send(3));

        op.progress().unwrap();
        assert!(send(4));

        op.progress().unwrap();
        assert_eq!(
            receiver.values(),
            vec![
                (TaskId(0), TaskId(1), Some(vec![1])),
                (TaskId(0), TaskId(1), Some(vec![2])),
                (TaskId(0), TaskId(1), Some(vec![4])),
            ]
        );

        // Internal deliveries never touch the send pool.
        assert_eq!(op.send_pool().acquired(), 0);
        assert_eq!(op.in_flight(), 0);
    }

    #[test]
    fn test_declined_delivery_resumes() {
        let network = LocalNetwork::cluster(1, 4);
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[0, 1])).unwrap();
        let receiver = Recorder::default();
        let op = operation(small_config(), &router, &network[0], &receiver, None);

        *receiver.declined.lock() = Some(TaskId(1));
        let routing = router.route_all(TaskId(0)).unwrap();
        assert!(op.send(TaskId(0), Content::Plain(vec![5]), 0, routing).unwrap());

        op.progress().unwrap();
        op.progress().unwrap();
        assert_eq!(receiver.values(), vec![(TaskId(0), TaskId(0), Some(vec![5]))]);
        assert_eq!(op.in_flight(), 1);

        *receiver.declined.lock() = None;
        op.progress().unwrap();

        // Task 0 accepted earlier and is not offered the message again.
        assert_eq!(
            receiver.values(),
            vec![
                (TaskId(0), TaskId(0), Some(vec![5])),
                (TaskId(0), TaskId(1), Some(vec![5])),
            ]
        );
        assert_eq!(op.in_flight(), 0);
    }

    #[test]
    fn test_remote_delivery_conserves_buffers() {
        let network = LocalNetwork::cluster(2, 2);
        let sources = tasks(&[0]);
        let destinations = tasks(&[2, 3]);

        let sender_router =
            PartitionRouter::new(plan(0), sources.clone(), destinations.clone()).unwrap();
        let receiver_router = PartitionRouter::new(plan(1), sources, destinations).unwrap();

        let sender = Recorder::default();
        let receiver = Recorder::default();
        let config = CommsConfig {
            send_pending_max: 8,
            ..small_config()
        };

        let op0 = operation(config.clone(), &sender_router, &network[0], &sender, None);
        let op1 = operation(config, &receiver_router, &network[1], &receiver, None);

        // Numbers above 250 take three bytes each, so every value spans two 48 byte buffers.
        let values = (0..5u32)
            .map(|i| (i * 1000..i * 1000 + 20).map(|v| v + 300).collect_vec())
            .collect_vec();
        for v in &values {
            let routing = sender_router.route_all(TaskId(0)).unwrap();
            assert!(op0.send(TaskId(0), Content::Plain(v.clone()), 0, routing).unwrap());
        }

        drive(&[&op0, &op1], &network);

        let received = receiver.values();
        assert_eq!(received.len(), 10);
        assert_eq!(*receiver.passed.lock(), 5);

        for target in &[TaskId(2), TaskId(3)] {
            let got = received
                .iter()
                .filter(|(_, t, _)| t == target)
                .map(|(s, _, v)| {
                    assert_eq!(*s, TaskId(0));
                    v.clone().unwrap()
                })
                .collect_vec();
            assert_eq!(got, values);
        }

        let send_pool = op0.send_pool();
        assert!(send_pool.acquired() > 5);
        assert_eq!(send_pool.acquired(), send_pool.released());

        let receive_pool = op1.receive_pool(ExecutorId(0)).unwrap();
        assert!(receive_pool.acquired() > 5);
        assert_eq!(receive_pool.acquired(), receive_pool.released());
        assert!(sender.values().is_empty());
    }

    #[test]
    fn test_sources_share_send_pool() {
        let network = LocalNetwork::cluster(2, 2);
        let sources = tasks(&[0, 1]);
        let r0 = PartitionRouter::new(plan(0), sources.clone(), tasks(&[2])).unwrap();
        let r1 = PartitionRouter::new(plan(1), sources, tasks(&[2])).unwrap();

        let receiver = Recorder::default();
        let op0 = operation(small_config(), &r0, &network[0], &Recorder::default(), None);
        let op1 = operation(small_config(), &r1, &network[1], &receiver, None);

        // Values take three bytes each: 20 of them fill two 48 byte buffers, 40 fill three.
        // Two three buffer messages never fit in the four buffer send pool together.
        let two = (300..320).collect_vec();
        let three = (1000..1040).collect_vec();
        let other = (2000..2040).collect_vec();

        for (source, value) in vec![(0, &two), (0, &three), (1, &other)] {
            let routing = r0.route_all(TaskId(source)).unwrap();
            assert!(op0
                .send(TaskId(source), Content::Plain(value.clone()), 0, routing)
                .unwrap());
        }

        drive(&[&op0, &op1], &network);

        let from = |source: i32| {
            receiver
                .values()
                .into_iter()
                .filter(|(s, _, _)| *s == TaskId(source))
                .map(|(_, t, v)| {
                    assert_eq!(t, TaskId(2));
                    v.unwrap()
                })
                .collect_vec()
        };
        assert_eq!(from(0), vec![two, three]);
        assert_eq!(from(1), vec![other]);

        let pool = op0.send_pool();
        assert_eq!(pool.acquired(), 8);
        assert_eq!(pool.released(), 8);
    }

    #[test]
    fn test_fan_out_resumes_after_rejection() {
        let network = LocalNetwork::cluster(3, 1);
        let sources = tasks(&[0]);
        let destinations = tasks(&[2, 4]);
        let router = |me| PartitionRouter::new(plan(me), sources.clone(), destinations.clone());
        let (r0, r1, r2) = (router(0).unwrap(), router(1).unwrap(), router(2).unwrap());

        let near = Recorder::default();
        let far = Recorder::default();
        let op0 = operation(small_config(), &r0, &network[0], &Recorder::default(), None);
        let op1 = operation(small_config(), &r1, &network[1], &near, None);
        // A single receive buffer stalls the link to executor 2 until op2 consumes.
        let tight = CommsConfig {
            receive_buffer_count: 1,
            ..small_config()
        };
        let op2 = operation(tight, &r2, &network[2], &far, None);

        let send = |v: u32| {
            let routing = r0.route_all(TaskId(0)).unwrap();
            op0.send(TaskId(0), Content::Plain(vec![v]), 0, routing)
                .unwrap()
        };

        assert!(send(1));
        op0.progress().unwrap();
        network[0].progress().unwrap();

        assert!(send(2));
        op0.progress().unwrap();
        network[0].progress().unwrap();
        assert_eq!(network[0].pending_sends(), 1);

        // Executor 1 takes the third message, executor 2 refuses it while 2 is stuck.
        assert!(send(3));
        op0.progress().unwrap();
        op0.progress().unwrap();
        assert_eq!(network[0].pending_sends(), 2);
        assert!(op0.in_flight() > 0);

        drive(&[&op0, &op1, &op2], &network);

        let expected = |target: i32| {
            (1..=3)
                .map(|v| (TaskId(0), TaskId(target), Some(vec![v])))
                .collect_vec()
        };
        assert_eq!(near.values(), expected(2));
        assert_eq!(far.values(), expected(4));
    }

    #[test]
    fn test_declined_pass_downstream_delivers_once() {
        let network = LocalNetwork::cluster(2, 2);
        let r0 = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[2])).unwrap();
        let r1 = PartitionRouter::new(plan(1), tasks(&[0]), tasks(&[2])).unwrap();

        let receiver = Recorder::default();
        *receiver.decline_down.lock() = 1;
        let op0 = operation(small_config(), &r0, &network[0], &Recorder::default(), None);
        let op1 = operation(small_config(), &r1, &network[1], &receiver, None);

        let routing = r0.route_all(TaskId(0)).unwrap();
        assert!(op0.send(TaskId(0), Content::Plain(vec![6]), 0, routing).unwrap());
        drive(&[&op0, &op1], &network);

        assert_eq!(receiver.values(), vec![(TaskId(0), TaskId(2), Some(vec![6]))]);
        assert_eq!(*receiver.passed.lock(), 1);
        assert_eq!(*receiver.decline_down.lock(), 0);

        let pool = op1.receive_pool(ExecutorId(0)).unwrap();
        assert_eq!(pool.acquired(), pool.released());
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let network = LocalNetwork::cluster(2, 4);
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[1, 2])).unwrap();
        let transport = Arc::new(FlakyTransport {
            inner: network[0].clone(),
            broken: AtomicBool::new(true),
        });
        let receiver = Recorder::default();
        let op = operation_on(small_config(), &router, transport, &receiver, None);

        let routing = router.route_all(TaskId(0)).unwrap();
        for v in 1..=2 {
            assert!(op
                .send(TaskId(0), Content::Plain(vec![v]), 0, routing.clone())
                .unwrap());
        }

        let err = op.progress().unwrap_err();
        assert_eq!(
            err.downcast_ref::<NetworkError>(),
            Some(&NetworkError::Disconnected)
        );
        assert!(op.is_failed());

        // The local copy of the first send went out, the second send was dropped unsent.
        assert_eq!(receiver.values(), vec![(TaskId(0), TaskId(1), Some(vec![1]))]);
        assert_eq!(op.in_flight(), 0);
        assert_eq!(op.send_pool().acquired(), 1);
        assert_eq!(op.send_pool().released(), 1);

        let failed = |err: Error| {
            matches!(
                err.downcast_ref::<OperationError>(),
                Some(OperationError::Failed { edge: EdgeId(1), .. })
            )
        };
        assert!(failed(
            op.send(TaskId(0), Content::Plain(vec![3]), 0, routing)
                .unwrap_err()
        ));
        assert!(failed(op.progress().unwrap_err()));
        assert!(failed(op.close(Duration::from_millis(10)).unwrap_err()));
        assert!(op.is_closed());
        assert_eq!(receiver.values().len(), 1);
    }

    #[test]
    fn test_point_send_is_stamped() {
        let network = LocalNetwork::cluster(2, 2);
        let destinations = tasks(&[2, 3]);
        let r0 = PartitionRouter::new(plan(0), tasks(&[0]), destinations.clone()).unwrap();
        let r1 = PartitionRouter::new(plan(1), tasks(&[0]), destinations).unwrap();

        let receiver = Recorder::default();
        let op0 = operation(small_config(), &r0, &network[0], &Recorder::default(), None);
        let op1 = operation(small_config(), &r1, &network[1], &receiver, None);

        let routing = r0.route_to(TaskId(0), TaskId(3)).unwrap();
        assert!(op0.send(TaskId(0), Content::Plain(vec![1]), 0, routing).unwrap());
        drive(&[&op0, &op1], &network);

        assert_eq!(receiver.values(), vec![(TaskId(0), TaskId(3), Some(vec![1]))]);
    }

    #[test]
    fn test_store_based_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let stores = StoreManager::new(dir.path()).unwrap();
        let network = LocalNetwork::cluster(2, 2);
        let config = CommsConfig {
            store_based: true,
            store_dir: Some(dir.path().to_path_buf()),
            ..small_config()
        };

        let destinations = tasks(&[1, 2]);
        let r0 = PartitionRouter::new(plan(0), tasks(&[0]), destinations.clone()).unwrap();
        let r1 = PartitionRouter::new(plan(1), tasks(&[0]), destinations).unwrap();

        let local = Recorder::default();
        let remote = Recorder::default();
        let store0 = stores.add_operation(EdgeId(10)).unwrap();
        let store1 = stores.add_operation(EdgeId(11)).unwrap();

        let op0 = operation(config.clone(), &r0, &network[0], &local, Some(store0.clone()));
        let op1 = operation(config, &r1, &network[1], &remote, Some(store1.clone()));

        let routing = r0.route_all(TaskId(0)).unwrap();
        assert!(op0.send(TaskId(0), Content::Plain(vec![8, 9]), 0, routing).unwrap());
        drive(&[&op0, &op1], &network);

        // Receivers only get a handle, the value is in the store keyed by the source.
        assert_eq!(local.values(), vec![(TaskId(0), TaskId(1), None)]);
        assert_eq!(remote.values(), vec![(TaskId(0), TaskId(2), None)]);

        let key = 0i32.to_be_bytes();
        assert_eq!(store0.get_values::<Vec<u32>>(&key).unwrap(), vec![vec![8, 9]]);
        assert_eq!(store1.get_values::<Vec<u32>>(&key).unwrap(), vec![vec![8, 9]]);

        let pool = op1.receive_pool(ExecutorId(0)).unwrap();
        assert_eq!(pool.acquired(), pool.released());
    }

    #[test]
    fn test_close() {
        let network = LocalNetwork::cluster(1, 4);
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[1])).unwrap();
        let receiver = Recorder::default();
        let op = operation(small_config(), &router, &network[0], &receiver, None);

        *receiver.declined.lock() = Some(TaskId(1));
        let routing = router.route_all(TaskId(0)).unwrap();
        assert!(op.send(TaskId(0), Content::Plain(vec![1]), 0, routing.clone()).unwrap());

        let err = op.close(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OperationError>(),
            Some(OperationError::InFlightOnClose { remaining: 1, .. })
        ));

        let err = op.send(TaskId(0), Content::Plain(vec![2]), 0, routing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OperationError>(),
            Some(OperationError::Closed(EdgeId(1)))
        ));

        // Nothing moves after closing.
        *receiver.declined.lock() = None;
        op.progress().unwrap();
        assert!(receiver.values().is_empty());
    }

    #[test]
    fn test_close_drains() {
        let network = LocalNetwork::cluster(1, 4);
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[1])).unwrap();
        let receiver = Recorder::default();
        let op = operation(small_config(), &router, &network[0], &receiver, None);

        let routing = router.route_all(TaskId(0)).unwrap();
        assert!(op.send(TaskId(0), Content::Plain(vec![1]), 0, routing).unwrap());
        op.close(Duration::from_secs(5)).unwrap();

        assert_eq!(receiver.values().len(), 1);
        assert!(op.is_closed());
    }

    #[test]
    fn test_rejects_unknown_source() {
        let network = LocalNetwork::cluster(1, 4);
        let router = PartitionRouter::new(plan(0), tasks(&[0]), tasks(&[1])).unwrap();
        let op = operation(small_config(), &router, &network[0], &Recorder::default(), None);

        let err = op
            .send(TaskId(1), Content::Plain(vec![]), 0, default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OperationError>(),
            Some(OperationError::UnknownSendKey(SendKey::Source(TaskId(1))))
        ));
    }
}
