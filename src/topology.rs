// src/topology.rs
// Exchange/queue/binding declarations and the per-connection declaration cache.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::broker::BrokerChannel;
use crate::errors::{BusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }

    /// The nameless default exchange and `amq.*` exchanges exist on every
    /// broker and cannot be declared by clients with arbitrary properties.
    pub fn is_predeclared(&self) -> bool {
        is_predeclared_exchange(&self.name)
    }
}

pub(crate) fn is_predeclared_exchange(name: &str) -> bool {
    name.is_empty() || name.starts_with("amq.")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private, connection-scoped queue (used for RPC replies).
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingDeclaration {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl BindingDeclaration {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// One (exchange, queue, binding) triple. Any part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchange: Option<ExchangeDeclaration>,
    pub queue: Option<QueueDeclaration>,
    pub binding: Option<BindingDeclaration>,
}

impl Topology {
    /// Exchange, queue and the binding between them.
    pub fn subscription(exchange: ExchangeDeclaration, queue: QueueDeclaration, routing_key: impl Into<String>) -> Self {
        let binding = if exchange.name.is_empty() {
            // Every queue is implicitly bound to the default exchange.
            None
        } else {
            Some(BindingDeclaration::new(&exchange.name, &queue.name, routing_key))
        };
        Self {
            exchange: Some(exchange),
            queue: Some(queue),
            binding,
        }
    }
}

/// Names of what a `declare` call made available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHandle {
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
}

#[derive(Debug, Default)]
struct DeclaredTopology {
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, QueueDeclaration>,
    bindings: HashSet<BindingDeclaration>,
    // Declaration order, replayed as-is after a reconnect.
    order: Vec<Declared>,
}

#[derive(Debug, Clone)]
enum Declared {
    Exchange(ExchangeDeclaration),
    Queue(QueueDeclaration),
    Binding(BindingDeclaration),
}

enum CacheState {
    Known,
    Missing,
}

impl DeclaredTopology {
    fn check_exchange(&self, exchange: &ExchangeDeclaration) -> Result<CacheState> {
        match self.exchanges.get(&exchange.name) {
            None => Ok(CacheState::Missing),
            Some(existing) if existing == exchange => Ok(CacheState::Known),
            Some(existing) => Err(BusError::Configuration(format!(
                "exchange '{}' already declared as {:?} (durable: {}, auto_delete: {}), cannot redeclare as {:?} (durable: {}, auto_delete: {})",
                exchange.name,
                existing.kind,
                existing.durable,
                existing.auto_delete,
                exchange.kind,
                exchange.durable,
                exchange.auto_delete
            ))),
        }
    }

    fn check_queue(&self, queue: &QueueDeclaration) -> Result<CacheState> {
        match self.queues.get(&queue.name) {
            None => Ok(CacheState::Missing),
            Some(existing) if existing == queue => Ok(CacheState::Known),
            Some(existing) => Err(BusError::Configuration(format!(
                "queue '{}' already declared with different properties ({:?})",
                queue.name, existing
            ))),
        }
    }

    // The broker call happens outside the lock, so a concurrent declaration
    // of the same name may have landed in between.
    fn record_exchange(&mut self, exchange: &ExchangeDeclaration) -> Result<()> {
        if let CacheState::Missing = self.check_exchange(exchange)? {
            self.exchanges.insert(exchange.name.clone(), exchange.clone());
            self.order.push(Declared::Exchange(exchange.clone()));
        }
        Ok(())
    }

    fn record_queue(&mut self, queue: &QueueDeclaration) -> Result<()> {
        if let CacheState::Missing = self.check_queue(queue)? {
            self.queues.insert(queue.name.clone(), queue.clone());
            self.order.push(Declared::Queue(queue.clone()));
        }
        Ok(())
    }
}

/// Declares topology once per connection and remembers it.
///
/// Repeating an identical declaration costs no broker round-trip; a
/// declaration that disagrees with a cached one with the same name fails with
/// a configuration error and is never retried.
#[derive(Debug, Default)]
pub struct TopologyProvider {
    declared: Mutex<DeclaredTopology>,
}

impl TopologyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache(&self) -> MutexGuard<'_, DeclaredTopology> {
        self.declared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn declare(&self, channel: &dyn BrokerChannel, topology: &Topology) -> Result<TopologyHandle> {
        if let Some(exchange) = &topology.exchange {
            self.declare_exchange(channel, exchange).await?;
        }
        if let Some(queue) = &topology.queue {
            self.declare_queue(channel, queue).await?;
        }
        if let Some(binding) = &topology.binding {
            self.bind(channel, binding).await?;
        }

        Ok(TopologyHandle {
            exchange: topology.exchange.as_ref().map(|e| e.name.clone()),
            queue: topology.queue.as_ref().map(|q| q.name.clone()),
            routing_key: topology.binding.as_ref().map(|b| b.routing_key.clone()),
        })
    }

    pub async fn declare_exchange(&self, channel: &dyn BrokerChannel, exchange: &ExchangeDeclaration) -> Result<()> {
        if exchange.is_predeclared() {
            return Ok(());
        }
        match self.cache().check_exchange(exchange)? {
            CacheState::Known => return Ok(()),
            CacheState::Missing => {}
        }

        debug!(exchange = %exchange.name, kind = ?exchange.kind, "Declaring exchange");
        channel.declare_exchange(exchange).await.map_err(|e| {
            warn!(exchange = %exchange.name, error = %e, "Exchange declaration failed");
            e
        })?;

        self.cache().record_exchange(exchange)
    }

    pub async fn declare_queue(&self, channel: &dyn BrokerChannel, queue: &QueueDeclaration) -> Result<()> {
        match self.cache().check_queue(queue)? {
            CacheState::Known => return Ok(()),
            CacheState::Missing => {}
        }

        debug!(queue = %queue.name, durable = queue.durable, exclusive = queue.exclusive, "Declaring queue");
        channel.declare_queue(queue).await?;

        self.cache().record_queue(queue)
    }

    pub async fn bind(&self, channel: &dyn BrokerChannel, binding: &BindingDeclaration) -> Result<()> {
        if binding.exchange.is_empty() || self.cache().bindings.contains(binding) {
            return Ok(());
        }

        debug!(
            exchange = %binding.exchange,
            queue = %binding.queue,
            routing_key = %binding.routing_key,
            "Binding queue"
        );
        channel.bind_queue(binding).await?;

        let mut cache = self.cache();
        if cache.bindings.insert(binding.clone()) {
            cache.order.push(Declared::Binding(binding.clone()));
        }
        Ok(())
    }

    /// Redeclare everything cached, in the original order, on a fresh channel.
    pub async fn replay(&self, channel: &dyn BrokerChannel) -> Result<usize> {
        let order = self.cache().order.clone();
        for declared in &order {
            match declared {
                Declared::Exchange(exchange) => channel.declare_exchange(exchange).await?,
                Declared::Queue(queue) => channel.declare_queue(queue).await?,
                Declared::Binding(binding) => channel.bind_queue(binding).await?,
            }
        }
        info!(declarations = order.len(), "Replayed topology");
        Ok(order.len())
    }

    /// Drop the whole cache; the next declarations go to the broker again.
    pub fn forget_all(&self) {
        *self.cache() = DeclaredTopology::default();
    }

    pub fn is_exchange_declared(&self, name: &str) -> bool {
        self.cache().exchanges.contains_key(name)
    }

    pub fn is_queue_declared(&self, name: &str) -> bool {
        self.cache().queues.contains_key(name)
    }

    pub fn declaration_count(&self) -> usize {
        self.cache().order.len()
    }
}
