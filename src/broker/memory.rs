// src/broker/memory.rs
// In-process broker used by tests and demos. Routes like RabbitMQ for direct,
// topic and fanout exchanges; headers exchanges route like fanout.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::{BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, DeliveryStream, Settlement};
use crate::errors::{BusError, Result};
use crate::message::{InboundDelivery, OutboundMessage};
use crate::topology::{BindingDeclaration, ExchangeDeclaration, ExchangeType, QueueDeclaration};

/// How the broker answers publishes on channels in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    #[default]
    Ack,
    Nack,
    /// Never confirm.
    Silent,
    /// Ack after the given delay.
    Delayed(Duration),
}

/// Publishes and settlements remembered for inspection.
pub const RECORD_LIMIT: usize = 10_000;

fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == RECORD_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

/// A settled delivery, recorded for assertions.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub settlement: Settlement,
    pub delivery: InboundDelivery,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<InboundDelivery>,
}

struct MemoryQueue {
    declaration: QueueDeclaration,
    ready: VecDeque<InboundDelivery>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    // Index of the next consumer (round robin) with prefetch room.
    fn pick_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.next_consumer + offset) % count;
            let slot = &self.consumers[index];
            if slot.prefetch == 0 || slot.in_flight < slot.prefetch as usize {
                self.next_consumer = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer_tag: String,
    delivery: InboundDelivery,
}

#[derive(Default)]
struct BrokerState {
    generation: u64,
    refuse_connections: bool,
    connection_count: usize,
    next_channel_key: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingDeclaration>,
    unacked: HashMap<u64, Unacked>,
    confirm_mode: ConfirmMode,
    confirm_senders: HashMap<u64, mpsc::UnboundedSender<ConfirmEvent>>,
    declare_calls: usize,
    published: VecDeque<OutboundMessage>,
    settlements: VecDeque<SettlementRecord>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let declaration = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match declaration.kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeType::Fanout | ExchangeType::Headers => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, delivery: InboundDelivery, front: bool) {
        if let Some(target) = self.queues.get_mut(queue) {
            if front {
                target.ready.push_front(delivery);
            } else {
                target.ready.push_back(delivery);
            }
            self.dispatch(queue);
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.pick_consumer() else {
                break;
            };
            let Some(mut delivery) = queue.ready.pop_front() else {
                break;
            };

            self.next_delivery_tag += 1;
            delivery.delivery_tag = self.next_delivery_tag;

            let slot = &mut queue.consumers[index];
            if slot.sender.send(delivery.clone()).is_err() {
                // Consumer went away: drop it and keep the message.
                trace!(queue = queue_name, consumer_tag = %slot.tag, "Removing closed consumer");
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                queue.ready.push_front(delivery);
                continue;
            }
            slot.in_flight += 1;
            let (channel, consumer_tag) = (slot.channel, slot.tag.clone());
            self.unacked.insert(
                self.next_delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    channel,
                    consumer_tag,
                    delivery,
                },
            );
        }
    }

    fn release_in_flight(&mut self, unacked: &Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(slot) = queue.consumers.iter_mut().find(|c| c.tag == unacked.consumer_tag) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
    }

    fn requeue_where(&mut self, predicate: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| predicate(*unacked))
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so pushing to the front restores the original order.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.release_in_flight(&unacked);
                let mut delivery = unacked.delivery;
                delivery.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(delivery);
                    if !touched.contains(&unacked.queue) {
                        touched.push(unacked.queue);
                    }
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn drop_channel(&mut self, channel: u64) {
        self.confirm_senders.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
            queue.next_consumer = 0;
        }
        self.requeue_where(|unacked| unacked.channel == channel);
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(other)) => word == other && matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Shared handle to one in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.state().confirm_mode = mode;
    }

    /// Make later connection attempts fail, as if the broker were down.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Drop every open connection. Consumers stop, confirm streams close,
    /// exclusive queues are deleted and unacked messages are requeued.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.confirm_senders.clear();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
            queue.next_consumer = 0;
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.declaration.exclusive)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            state.queues.remove(name);
        }
        state.bindings.retain(|b| !exclusive.contains(&b.queue));

        state.requeue_where(|_| true);
        info!(generation = state.generation, "Memory broker dropped all connections");
    }

    /// Forget every exchange, queue and binding, as a broker restart would.
    pub fn reset_topology(&self) {
        let mut state = self.state();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
        state.unacked.clear();
    }

    pub fn declare_calls(&self) -> usize {
        self.state().declare_calls
    }

    pub fn connection_count(&self) -> usize {
        self.state().connection_count
    }

    /// The most recent publishes, oldest first. At most `RECORD_LIMIT` are kept.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state().published.iter().cloned().collect()
    }

    /// The most recent settlements, oldest first. At most `RECORD_LIMIT` are kept.
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.iter().cloned().collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.routing_key == routing_key)
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state().queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state().queues.get(name).map_or(0, |q| q.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }
}

fn lock(state: &Arc<Mutex<BrokerState>>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(BusError::Connection("connection refused by memory broker".to_string()));
        }
        state.connection_count += 1;
        debug!(generation = state.generation, "Memory broker accepted connection");
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            generation: state.generation,
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire) && lock(&self.state).generation == self.generation
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(BusError::Connection("connection is closed".to_string()));
        }
        let mut state = lock(&self.state);
        state.next_channel_key += 1;
        let key = state.next_channel_key;
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            key,
            generation: self.generation,
            open: AtomicBool::new(true),
            confirms: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    key: u64,
    generation: u64,
    open: AtomicBool,
    confirms: AtomicBool,
    next_seq: AtomicU64,
}

impl MemoryChannel {
    // Lock the broker, failing if this channel can no longer be used.
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock(&self.state);
        if state.generation != self.generation {
            return Err(BusError::Connection("connection to memory broker was lost".to_string()));
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(BusError::Channel(format!("channel {} is closed", self.key)));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        (self.key % u16::MAX as u64) as u16
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && lock(&self.state).generation == self.generation
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.live_state()?;
        state.declare_calls += 1;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BusError::Configuration(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()> {
        let mut state = self.live_state()?;
        state.declare_calls += 1;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.declaration != *queue => Err(BusError::Configuration(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(queue.name.clone(), MemoryQueue::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingDeclaration) -> Result<()> {
        let mut state = self.live_state()?;
        state.declare_calls += 1;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Channel(format!("NOT_FOUND - no exchange '{}'", binding.exchange)));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{}'", binding.queue)));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>> {
        let mut state = self.live_state()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.confirm_senders.insert(self.key, sender);
        self.confirms.store(true, Ordering::Release);
        Ok(receiver)
    }

    fn next_publish_seq(&self) -> u64 {
        if self.confirms.load(Ordering::Acquire) {
            self.next_seq.load(Ordering::Acquire)
        } else {
            0
        }
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut state = self.live_state()?;

        let targets = match state.route(&message.exchange, &message.routing_key) {
            Ok(targets) => targets,
            Err(e) => {
                // Publishing to a missing exchange closes the channel.
                self.open.store(false, Ordering::Release);
                state.drop_channel(self.key);
                return Err(e);
            }
        };

        record(&mut state.published, message.clone());
        trace!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            queues = targets.len(),
            "Memory broker routed message"
        );

        for queue in &targets {
            let delivery = InboundDelivery {
                delivery_tag: 0,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: false,
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            };
            state.enqueue(queue, delivery, false);
        }

        if self.confirms.load(Ordering::Acquire) {
            let sequence = self.next_seq.fetch_add(1, Ordering::AcqRel);
            if let Some(sender) = state.confirm_senders.get(&self.key).cloned() {
                match state.confirm_mode {
                    ConfirmMode::Ack => {
                        let _ = sender.send(ConfirmEvent::Ack { sequence, multiple: false });
                    }
                    ConfirmMode::Nack => {
                        let _ = sender.send(ConfirmEvent::Nack { sequence, multiple: false });
                    }
                    ConfirmMode::Silent => {}
                    ConfirmMode::Delayed(delay) => {
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = sender.send(ConfirmEvent::Ack { sequence, multiple: false });
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        let mut state = self.live_state()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)))?;
        target.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel: self.key,
            prefetch,
            in_flight: 0,
            sender,
        });
        state.dispatch(queue);

        debug!(queue, consumer_tag, prefetch, "Memory broker registered consumer");
        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok::<_, BusError>(delivery), receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let mut state = self.live_state()?;
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            BusError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
        })?;
        state.release_in_flight(&unacked);

        let settled = SettlementRecord {
            queue: unacked.queue.clone(),
            delivery_tag,
            settlement,
            delivery: unacked.delivery.clone(),
        };
        record(&mut state.settlements, settled);

        let requeue = matches!(
            settlement,
            Settlement::Nack { requeue: true } | Settlement::Reject { requeue: true }
        );
        if requeue {
            let mut delivery = unacked.delivery;
            delivery.redelivered = true;
            state.enqueue(&unacked.queue, delivery, true);
        } else {
            // Freed prefetch room may let a waiting message through.
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            let mut state = lock(&self.state);
            if state.generation == self.generation {
                state.drop_channel(self.key);
            }
        }
        Ok(())
    }
}
