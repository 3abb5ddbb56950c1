// src/operations/requester.rs
// RPC client side: correlation table, private reply queue and request calls.

use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::consumer::{self, ConsumerPlan, DeliveryHandler, DetachHook};
use super::publisher::{outbound_properties, send};
use super::BusCore;
use crate::broker::Settlement;
use crate::context::MessageContext;
use crate::errors::{BusError, Result};
use crate::message::{BusMessage, InboundDelivery, OutboundMessage};
use crate::topology::{ExchangeDeclaration, QueueDeclaration, Topology};

type Reply = std::result::Result<InboundDelivery, BusError>;

struct PendingEntry {
    id: u64,
    sender: oneshot::Sender<Reply>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingEntry>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Requests waiting for a reply, keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    table: PendingTable,
    next_id: AtomicU64,
}

impl PendingRequests {
    /// Register before publishing so an early reply finds its waiter.
    pub fn register(&self, correlation_id: &str) -> Result<PendingReply> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut table = lock(&self.table);
        if table.contains_key(correlation_id) {
            return Err(BusError::DuplicateCorrelation(correlation_id.to_string()));
        }
        table.insert(correlation_id.to_string(), PendingEntry { id, sender });

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            id,
            receiver,
            table: self.table.clone(),
        })
    }

    /// Hand a reply to its waiter. Unknown or already answered ids are
    /// ignored.
    pub fn resolve(&self, correlation_id: &str, reply: InboundDelivery) -> bool {
        let entry = lock(&self.table).remove(correlation_id);
        match entry {
            Some(entry) => entry.sender.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    pub fn fail_all(&self, error: impl Fn() -> BusError) -> usize {
        let entries: Vec<PendingEntry> = lock(&self.table).drain().map(|(_, entry)| entry).collect();
        let count = entries.len();
        for entry in entries {
            let _ = entry.sender.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }
}

/// Waiter for one reply. Dropping it forgets the pending request.
pub(crate) struct PendingReply {
    correlation_id: String,
    id: u64,
    receiver: oneshot::Receiver<Reply>,
    table: PendingTable,
}

impl PendingReply {
    pub async fn wait(mut self, timeout: Duration) -> Result<InboundDelivery> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BusError::Shutdown),
            Err(_) => {
                debug!(correlation_id = %self.correlation_id, ?timeout, "Request timed out");
                Err(BusError::RequestTimeout {
                    correlation_id: self.correlation_id.clone(),
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        if table.get(&self.correlation_id).is_some_and(|entry| entry.id == self.id) {
            table.remove(&self.correlation_id);
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Per-call request settings.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Defaults to the request exchange of the naming conventions.
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
    /// Fresh UUID when unset.
    pub correlation_id: Option<String>,
    pub context: Option<MessageContext>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn context(mut self, context: MessageContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Clone)]
pub struct Requester {
    core: Arc<BusCore>,
}

impl Requester {
    pub(crate) fn new(core: Arc<BusCore>) -> Self {
        Self { core }
    }

    /// Send `request` and wait for the correlated reply.
    #[instrument(
        name = "request",
        parent = &self.core.span,
        skip_all,
        fields(request_type = Req::message_type(), correlation_id)
    )]
    pub async fn request<Req, Resp>(&self, request: &Req, options: RequestOptions) -> Result<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        let core = &self.core;
        core.serializer.registry().register::<Resp>();
        let reply_queue = self.reply_queue().await?;

        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        let timeout = options.timeout.unwrap_or_else(|| core.config.request_timeout());
        let exchange = options
            .exchange
            .unwrap_or_else(|| core.naming.request_exchange.clone());
        let routing_key = options.routing_key.unwrap_or_else(|| Req::routing_key().to_string());

        let pending = core.pending.register(&correlation_id)?;

        let mut context = core.contexts.stamp(options.context.unwrap_or_default());
        context.correlation_id = Some(correlation_id.clone());
        context.reply_to = Some(reply_queue.to_string());
        let mut properties = outbound_properties(core, Req::message_type());
        core.contexts.apply(&context, &mut properties)?;

        let declaration = ExchangeDeclaration::new(&exchange, core.naming.exchange_type);
        send(
            core,
            Some(&declaration),
            OutboundMessage {
                exchange,
                routing_key,
                payload: core.serializer.serialize(Some(request))?,
                properties,
            },
            false,
            None,
        )
        .await?;
        trace!(reply_queue = %reply_queue, "Request sent");

        let reply = pending.wait(timeout).await?;
        consumer::decode::<Resp>(core, &reply).ok_or_else(|| BusError::UndecodableReply {
            correlation_id,
            expected: Resp::message_type().to_string(),
        })
    }

    /// Name of the private reply queue, declared and consumed on first use.
    async fn reply_queue(&self) -> Result<&str> {
        let core = self.core.clone();
        let name = self
            .core
            .reply_queue
            .get_or_try_init(|| start_reply_consumer(core))
            .await?;
        Ok(name.as_str())
    }
}

async fn start_reply_consumer(core: Arc<BusCore>) -> Result<String> {
    let queue = core.naming.reply_queue();
    let plan = ConsumerPlan {
        topology: Topology {
            queue: Some(QueueDeclaration::exclusive(&queue)),
            ..Topology::default()
        },
        queue: queue.clone(),
        consumer_tag: core.naming.consumer_tag(),
        prefetch: 0,
    };

    let resolver = core.clone();
    let dispatch: DeliveryHandler = Arc::new(move |channel, delivery| {
        let core = resolver.clone();
        async move {
            let tag = delivery.delivery_tag;
            match delivery.properties.correlation_id.clone() {
                Some(correlation_id) if core.pending.resolve(&correlation_id, delivery) => {
                    trace!(correlation_id = %correlation_id, "Reply matched");
                }
                Some(correlation_id) => {
                    debug!(correlation_id = %correlation_id, "Dropping reply for unknown or finished request");
                }
                None => debug!("Dropping reply without correlation id"),
            }
            consumer::settle(channel.as_ref(), tag, Settlement::Ack).await;
        }
        .boxed()
    });

    // Replies to requests sent before the drop would land in a queue that no
    // longer exists.
    let detach_core = core.clone();
    let on_detach: DetachHook = Arc::new(move || {
        let failed = detach_core
            .pending
            .fail_all(|| BusError::Connection("reply consumer lost its channel".to_string()));
        if failed > 0 {
            warn!(failed, "Failed pending requests after losing the reply consumer");
        }
    });

    consumer::start(core, plan, dispatch, Some(on_detach)).await?;
    info!(queue = %queue, "Reply consumer started");
    Ok(queue)
}
