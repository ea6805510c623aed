//! Bounded per-connection outbound queue.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::{error::TransportError, events::unix_millis, frame::Outbound, types::ConnectionId};

/// Default number of messages buffered per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A message waiting for its socket to open.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    /// What to write.
    pub payload: Outbound,
    /// When it was queued, milliseconds since the epoch.
    pub enqueued_at: u64,
    /// Flush attempts so far.
    pub attempts: u32,
}

impl QueuedMessage {
    /// Wrap a payload, stamped with the current time.
    pub fn new(payload: Outbound) -> Self {
        Self {
            payload,
            enqueued_at: unix_millis(),
            attempts: 0,
        }
    }
}

/// Result of handing one message to the socket during a flush.
#[derive(Debug)]
pub enum FlushStep {
    /// Written.
    Sent,
    /// The message can never be written (e.g. does not serialize); dropped.
    Rejected(TransportError),
    /// The socket stopped accepting writes; the message is kept.
    NotOpen,
}

/// Counters for one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages written.
    pub sent: usize,
    /// Messages dropped as unwritable.
    pub rejected: usize,
    /// Messages still queued afterwards.
    pub remaining: usize,
}

/// FIFO buffers keyed by connection id.
///
/// No buffer ever holds more than `capacity` entries; overflow evicts the
/// oldest entry instead of blocking.
#[derive(Debug)]
pub struct OutboundQueue {
    queues: HashMap<ConnectionId, VecDeque<QueuedMessage>>,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    /// Create an empty queue set with the given per-connection capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Per-connection capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append to the tail. Returns the evicted head if the buffer was full.
    pub fn enqueue(&mut self, id: &ConnectionId, payload: Outbound) -> Option<QueuedMessage> {
        let capacity = self.capacity;
        let queue = self
            .queues
            .entry(id.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity.min(16)));

        queue.push_back(QueuedMessage::new(payload));
        if queue.len() > capacity {
            let evicted = queue.pop_front();
            warn!(connection_id = %id, capacity, "Outbound queue full; dropped oldest message");
            return evicted;
        }

        debug!(connection_id = %id, queued = queue.len(), "Message queued");
        None
    }

    /// Write queued messages in FIFO order until the buffer is empty or
    /// `write` reports the socket is no longer open.
    pub fn flush<F>(&mut self, id: &ConnectionId, mut write: F) -> FlushReport
    where
        F: FnMut(&Outbound) -> FlushStep,
    {
        let mut report = FlushReport::default();
        let Some(queue) = self.queues.get_mut(id) else {
            return report;
        };

        while let Some(mut message) = queue.pop_front() {
            message.attempts += 1;
            match write(&message.payload) {
                FlushStep::Sent => report.sent += 1,
                FlushStep::Rejected(err) => {
                    report.rejected += 1;
                    warn!(connection_id = %id, error = %err, "Dropping unwritable queued message");
                }
                FlushStep::NotOpen => {
                    queue.push_front(message);
                    break;
                }
            }
        }

        report.remaining = queue.len();
        if queue.is_empty() {
            self.queues.remove(id);
        }
        if report.sent > 0 || report.remaining > 0 {
            debug!(
                connection_id = %id,
                sent = report.sent,
                remaining = report.remaining,
                "Flushed outbound queue"
            );
        }
        report
    }

    /// Number of messages queued for an id.
    pub fn len(&self, id: &ConnectionId) -> usize {
        self.queues.get(id).map_or(0, VecDeque::len)
    }

    /// Check if nothing is queued for any id.
    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    /// Snapshot of the messages queued for an id, oldest first.
    pub fn pending(&self, id: &ConnectionId) -> Vec<QueuedMessage> {
        self.queues
            .get(id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything queued for an id.
    pub fn remove(&mut self, id: &ConnectionId) -> usize {
        self.queues.remove(id).map_or(0, |queue| queue.len())
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
