use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use super::{NetworkError, ReceiveListener, SendCallback, Transport};
use crate::buffer::{Buffer, BufferPool};
use crate::prelude::*;

struct Transfer {
    frames: Arc<Vec<Buffer>>,
    next_frame: usize,
    on_complete: SendCallback,
}

#[derive(Default)]
struct Link {
    pending: VecDeque<Transfer>,
}

#[derive(Clone)]
struct Registration {
    pool: Arc<BufferPool>,
    listener: Arc<dyn ReceiveListener>,
}

type LinkKey = (ExecutorId, ExecutorId, EdgeId);

struct Shared {
    executors: Vec<ExecutorId>,
    pending_limit: usize,
    // (sender, receiver, edge)
    links: Mutex<IndexMap<LinkKey, Link>>,
    // (receiver, sender, edge)
    receivers: Mutex<HashMap<LinkKey, Registration>>,
}

/// Transport connecting several executors inside one process. Every executor drives its own
/// outgoing links from `progress`: frames are copied into buffers of the receiving side's pool
/// and handed to its listener in order. A link stalls while the receiving pool is empty.
#[derive(Clone)]
pub struct LocalNetwork {
    me: ExecutorId,
    shared: Arc<Shared>,
}

impl LocalNetwork {
    /// Endpoints of a network of `executors` executors with ids `0..executors`. At most
    /// `pending_limit` sends are queued on any link.
    pub fn cluster(executors: usize, pending_limit: usize) -> Vec<LocalNetwork> {
        let shared = Arc::new(Shared {
            executors: (0..executors as i32).map(ExecutorId).collect(),
            pending_limit: max(pending_limit, 1),
            links: default(),
            receivers: default(),
        });

        shared
            .executors
            .iter()
            .map(|&me| LocalNetwork {
                me,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn check_executor(&self, id: ExecutorId) -> Result<(), NetworkError> {
        if self.shared.executors.contains(&id) {
            Ok(())
        } else {
            Err(NetworkError::UnknownExecutor(id))
        }
    }

    /// Number of sends of this executor that have not completed yet.
    pub fn pending_sends(&self) -> usize {
        self.shared
            .links
            .lock()
            .iter()
            .filter(|((from, _, _), _)| *from == self.me)
            .map(|(_, link)| link.pending.len())
            .sum()
    }

    fn registration(&self, key: &LinkKey) -> Option<Registration> {
        let (from, to, edge) = *key;
        self.shared.receivers.lock().get(&(to, from, edge)).cloned()
    }
}

impl Transport for LocalNetwork {
    fn executor(&self) -> ExecutorId {
        self.me
    }

    fn send_bytes(
        &self,
        target: ExecutorId,
        edge: EdgeId,
        frames: Arc<Vec<Buffer>>,
        on_complete: SendCallback,
    ) -> Result<bool, NetworkError> {
        self.check_executor(target)?;

        let mut links = self.shared.links.lock();
        let link = links.entry((self.me, target, edge)).or_default();

        if link.pending.len() >= self.shared.pending_limit {
            return Ok(false);
        }

        trace!(
            "queue {} frames from {} to {} on {}",
            frames.len(),
            self.me,
            target,
            edge
        );

        link.pending.push_back(Transfer {
            frames,
            next_frame: 0,
            on_complete,
        });

        Ok(true)
    }

    fn register_receiver(
        &self,
        source: ExecutorId,
        edge: EdgeId,
        pool: Arc<BufferPool>,
        listener: Arc<dyn ReceiveListener>,
    ) -> Result<(), NetworkError> {
        self.check_executor(source)?;

        let mut receivers = self.shared.receivers.lock();
        let key = (self.me, source, edge);

        if receivers.contains_key(&key) {
            return Err(NetworkError::DuplicateReceiver {
                source_executor: source,
                edge,
            });
        }

        debug!("{} receives from {} on {}", self.me, source, edge);
        receivers.insert(key, Registration { pool, listener });
        Ok(())
    }

    fn progress(&self) -> Result {
        let mut completed = vec![];

        {
            let mut links = self.shared.links.lock();

            for (key, link) in links.iter_mut() {
                if key.0 != self.me {
                    continue;
                }

                let registration = match self.registration(key) {
                    Some(r) => r,
                    None => continue,
                };

                'link: while let Some(transfer) = link.pending.front_mut() {
                    while let Some(frame) = transfer.frames.get(transfer.next_frame) {
                        let capacity = registration.pool.buffer_size();
                        if frame.size() > capacity {
                            return Err(NetworkError::FrameTooLarge {
                                size: frame.size(),
                                capacity,
                            }
                            .into());
                        }

                        let mut buffer = match registration.pool.acquire() {
                            Some(b) => b,
                            None => break 'link,
                        };

                        buffer.write(frame.as_slice());
                        registration
                            .listener
                            .on_buffer_received(self.me, key.2, buffer)?;
                        transfer.next_frame += 1;
                    }

                    if let Some(transfer) = link.pending.pop_front() {
                        completed.push(transfer);
                    }
                }
            }
        }

        for transfer in completed {
            let Transfer {
                frames,
                on_complete,
                ..
            } = transfer;

            // The sender reclaims its buffers from the completion, so let go of them first.
            drop(frames);
            on_complete(Ok(()));
        }

        Ok(())
    }
}

impl Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("me", &self.me)
            .field("executors", &self.shared.executors)
            .field("pending_limit", &self.shared.pending_limit)
            .finish()
    }
}
