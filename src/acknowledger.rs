// src/acknowledger.rs
// Tracks publisher confirms per (channel, sequence number).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::broker::ConfirmEvent;
use crate::errors::{BusError, Result};

/// Identifies one outstanding publish: sequence numbers are only unique
/// within the channel that assigned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketKey {
    pub channel: u64,
    pub sequence: u64,
}

impl TicketKey {
    pub fn new(channel: u64, sequence: u64) -> Self {
        Self { channel, sequence }
    }
}

impl fmt::Display for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} seq {}", self.channel, self.sequence)
    }
}

/// Terminal state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Acked,
    Nacked,
    TimedOut,
}

// Err carries the reason the owning channel went away.
type Resolution = std::result::Result<ConfirmOutcome, String>;

struct PendingTicket {
    id: u64,
    sender: oneshot::Sender<Resolution>,
}

type TicketTable = Arc<Mutex<HashMap<TicketKey, PendingTicket>>>;

fn lock(table: &TicketTable) -> MutexGuard<'_, HashMap<TicketKey, PendingTicket>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for one tracked publish. Dropping it before resolution cancels the
/// ticket and removes it from the table.
pub struct AckTicket {
    key: TicketKey,
    id: u64,
    timeout: Duration,
    receiver: Option<oneshot::Receiver<Resolution>>,
    table: TicketTable,
}

impl AckTicket {
    pub fn key(&self) -> TicketKey {
        self.key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the broker. A ticket still pending after its timeout is
    /// removed and reported as `TimedOut`.
    pub async fn wait(mut self) -> Result<ConfirmOutcome> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(BusError::Connection("confirm ticket already awaited".to_string()));
        };

        let resolution = match tokio::time::timeout(self.timeout, &mut receiver).await {
            Ok(received) => received.ok(),
            Err(_) => {
                if self.remove_if_pending() {
                    debug!(key = %self.key, timeout = ?self.timeout, "Publish confirm timed out");
                    return Ok(ConfirmOutcome::TimedOut);
                }
                // A resolution raced the deadline and won.
                receiver.try_recv().ok()
            }
        };

        match resolution {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(BusError::Connection(reason)),
            None => Err(BusError::Connection(format!(
                "confirm tracking for {} stopped before resolution",
                self.key
            ))),
        }
    }

    fn remove_if_pending(&self) -> bool {
        let mut table = lock(&self.table);
        match table.get(&self.key) {
            Some(pending) if pending.id == self.id => {
                table.remove(&self.key);
                true
            }
            _ => false,
        }
    }
}

impl Drop for AckTicket {
    fn drop(&mut self) {
        if self.remove_if_pending() {
            trace!(key = %self.key, "Confirm ticket cancelled");
        }
    }
}

impl fmt::Debug for AckTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckTicket")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Table of outstanding publisher confirms.
///
/// The first resolution of a key wins; later acks, nacks or timeouts for the
/// same key are no-ops.
pub struct PublishAcknowledger {
    tickets: TicketTable,
    default_timeout: Duration,
    next_id: AtomicU64,
}

impl PublishAcknowledger {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a ticket before the publish goes out. A key that is already
    /// pending is refused; the existing ticket stays intact.
    pub fn track(&self, key: TicketKey, timeout: Option<Duration>) -> Result<AckTicket> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = lock(&self.tickets);
            if table.contains_key(&key) {
                warn!(key = %key, "Refusing duplicate confirm ticket");
                return Err(BusError::DuplicateTicket(key));
            }
            table.insert(key, PendingTicket { id, sender });
        }

        Ok(AckTicket {
            key,
            id,
            timeout: timeout.unwrap_or(self.default_timeout),
            receiver: Some(receiver),
            table: self.tickets.clone(),
        })
    }

    /// Resolve one ticket. Unknown or already resolved keys are ignored.
    pub fn resolve(&self, key: TicketKey, outcome: ConfirmOutcome) -> bool {
        let pending = lock(&self.tickets).remove(&key);
        match pending {
            Some(pending) => {
                trace!(key = %key, ?outcome, "Resolving confirm ticket");
                // The waiter may have been dropped in the meantime.
                let _ = pending.sender.send(Ok(outcome));
                true
            }
            None => {
                trace!(key = %key, "Ignoring confirm for unknown ticket");
                false
            }
        }
    }

    /// Resolve every pending ticket of `channel` up to and including
    /// `sequence` (an AMQP `multiple` confirm).
    pub fn resolve_up_to(&self, channel: u64, sequence: u64, outcome: ConfirmOutcome) -> usize {
        let resolved: Vec<PendingTicket> = {
            let mut table = lock(&self.tickets);
            let keys: Vec<TicketKey> = table
                .keys()
                .filter(|key| key.channel == channel && key.sequence <= sequence)
                .copied()
                .collect();
            keys.iter().filter_map(|key| table.remove(key)).collect()
        };

        let count = resolved.len();
        for pending in resolved {
            let _ = pending.sender.send(Ok(outcome));
        }
        count
    }

    /// Fail every ticket still pending on a channel that closed.
    pub fn abandon_channel(&self, channel: u64) -> usize {
        let abandoned: Vec<(TicketKey, PendingTicket)> = {
            let mut table = lock(&self.tickets);
            let keys: Vec<TicketKey> = table.keys().filter(|key| key.channel == channel).copied().collect();
            keys.into_iter()
                .filter_map(|key| table.remove(&key).map(|pending| (key, pending)))
                .collect()
        };

        if !abandoned.is_empty() {
            warn!(channel, tickets = abandoned.len(), "Channel closed with unconfirmed publishes");
        }
        let count = abandoned.len();
        for (key, pending) in abandoned {
            let _ = pending.sender.send(Err(format!("channel closed before confirm for {}", key)));
        }
        count
    }

    /// Wait for a ticket; same as [`AckTicket::wait`].
    pub async fn await_resolution(&self, ticket: AckTicket) -> Result<ConfirmOutcome> {
        ticket.wait().await
    }

    pub fn pending(&self) -> usize {
        lock(&self.tickets).len()
    }

    pub fn is_pending(&self, key: TicketKey) -> bool {
        lock(&self.tickets).contains_key(&key)
    }

    /// Apply confirm events of one channel until its stream closes, then fail
    /// whatever is left.
    pub(crate) async fn pump(self: Arc<Self>, channel: u64, mut events: mpsc::UnboundedReceiver<ConfirmEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(channel, event);
        }
        debug!(channel, "Confirm stream closed");
        self.abandon_channel(channel);
    }

    pub(crate) fn apply(&self, channel: u64, event: ConfirmEvent) {
        match event {
            ConfirmEvent::Ack { sequence, multiple: false } => {
                self.resolve(TicketKey::new(channel, sequence), ConfirmOutcome::Acked);
            }
            ConfirmEvent::Ack { sequence, multiple: true } => {
                self.resolve_up_to(channel, sequence, ConfirmOutcome::Acked);
            }
            ConfirmEvent::Nack { sequence, multiple: false } => {
                self.resolve(TicketKey::new(channel, sequence), ConfirmOutcome::Nacked);
            }
            ConfirmEvent::Nack { sequence, multiple: true } => {
                self.resolve_up_to(channel, sequence, ConfirmOutcome::Nacked);
            }
            ConfirmEvent::Lost { sequence } => {
                let key = TicketKey::new(channel, sequence);
                if let Some(pending) = lock(&self.tickets).remove(&key) {
                    let _ = pending.sender.send(Err(format!("confirm for {} was lost", key)));
                }
            }
        }
    }
}

impl fmt::Debug for PublishAcknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishAcknowledger")
            .field("pending", &self.pending())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
