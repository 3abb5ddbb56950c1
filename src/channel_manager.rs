// src/channel_manager.rs
// One shared connection, a pool of idle channels and automatic recovery.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::acknowledger::PublishAcknowledger;
use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector};
use crate::config::{BusConfig, RecoveryMode};
use crate::errors::{BusError, Result};
use crate::topology::TopologyProvider;

struct PooledChannel {
    key: u64,
    channel: Arc<dyn BrokerChannel>,
    confirms: bool,
}

type IdlePool = Arc<Mutex<Vec<PooledChannel>>>;

fn lock_pool(pool: &IdlePool) -> MutexGuard<'_, Vec<PooledChannel>> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A channel held by one operation. Dropping the lease returns an open
/// channel to the idle pool and closes a broken or dedicated one.
pub struct ChannelLease {
    key: u64,
    channel: Arc<dyn BrokerChannel>,
    confirms: bool,
    pool: IdlePool,
    dedicated: bool,
    _permit: OwnedSemaphorePermit,
}

impl ChannelLease {
    /// Key the Publish Acknowledger files this channel's confirms under.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn confirms_enabled(&self) -> bool {
        self.confirms
    }

    /// Close the channel on release instead of pooling it. Used for consumer
    /// channels, whose consumers must stop with the lease.
    pub fn mark_dedicated(&mut self) {
        self.dedicated = true;
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let pooled = PooledChannel {
            key: self.key,
            channel: self.channel.clone(),
            confirms: self.confirms,
        };

        if !self.dedicated && pooled.channel.is_open() {
            trace!(channel = pooled.key, "Returning channel to pool");
            lock_pool(&self.pool).push(pooled);
            return;
        }

        debug!(channel = pooled.key, dedicated = self.dedicated, "Closing released channel");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = pooled.channel.close().await {
                    debug!(channel = pooled.key, error = %e, "Channel close failed");
                }
            });
        }
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("key", &self.key())
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

/// Hands out channels over one shared broker connection.
///
/// At most `max_channels` leases exist at a time. A lost connection is
/// re-established lazily by the next acquisition, which then replays the
/// declared topology before any channel is handed out.
pub struct ChannelManager {
    config: Arc<BusConfig>,
    connector: Arc<dyn BrokerConnector>,
    topology: Arc<TopologyProvider>,
    acknowledger: Arc<PublishAcknowledger>,
    connection: tokio::sync::Mutex<Option<Arc<dyn BrokerConnection>>>,
    idle: IdlePool,
    permits: Arc<Semaphore>,
    next_key: AtomicU64,
    generation: AtomicU64,
    recovering: AtomicBool,
    // Set when the connection dropped and recovery is disabled. Cleared only
    // by an explicit `connect()`.
    lost: AtomicBool,
    closed: AtomicBool,
    span: Span,
}

impl ChannelManager {
    pub fn new(
        config: Arc<BusConfig>,
        connector: Arc<dyn BrokerConnector>,
        topology: Arc<TopologyProvider>,
        acknowledger: Arc<PublishAcknowledger>,
        span: Span,
    ) -> Self {
        let max_channels = config.max_channels.max(1);
        Self {
            config,
            connector,
            topology,
            acknowledger,
            connection: tokio::sync::Mutex::new(None),
            idle: Arc::new(Mutex::new(Vec::new())),
            permits: Arc::new(Semaphore::new(max_channels)),
            next_key: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            recovering: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            span,
        }
    }

    pub fn config(&self) -> &Arc<BusConfig> {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyProvider> {
        &self.topology
    }

    pub fn acknowledger(&self) -> &Arc<PublishAcknowledger> {
        &self.acknowledger
    }

    /// Number of successful (re)connects so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn idle_channels(&self) -> usize {
        lock_pool(&self.idle).len()
    }

    pub fn available_leases(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Open the connection. Without automatic recovery this is also the only
    /// way back after a connection loss.
    pub async fn connect(&self) -> Result<()> {
        self.lost.store(false, Ordering::Release);
        self.live_connection().await.map(|_| ())
    }

    /// True after a connection loss that automatic recovery will not repair.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Lease a channel, reusing an idle one when possible.
    pub async fn acquire(&self) -> Result<ChannelLease> {
        if self.is_closed() {
            return Err(BusError::Shutdown);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BusError::Shutdown)?;
        let connection = self.live_connection().await?;

        let reusable = {
            let mut idle = lock_pool(&self.idle);
            let mut found = None;
            while let Some(pooled) = idle.pop() {
                if pooled.channel.is_open() {
                    found = Some(pooled);
                    break;
                }
                trace!(channel = pooled.key, "Discarding closed idle channel");
            }
            found
        };

        let pooled = match reusable {
            Some(pooled) => pooled,
            None => self.open_channel(connection.as_ref()).await?,
        };

        Ok(ChannelLease {
            key: pooled.key,
            channel: pooled.channel,
            confirms: pooled.confirms,
            pool: self.idle.clone(),
            dedicated: false,
            _permit: permit,
        })
    }

    /// Give a lease back explicitly. Same as dropping it.
    pub fn release(&self, lease: ChannelLease) {
        drop(lease);
    }

    /// Close every idle channel and the connection. Later acquisitions fail
    /// with `BusError::Shutdown`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.permits.close();

        let idle: Vec<PooledChannel> = lock_pool(&self.idle).drain(..).collect();
        for pooled in idle {
            if let Err(e) = pooled.channel.close().await {
                debug!(parent: &self.span, channel = pooled.key, error = %e, "Channel close failed");
            }
        }

        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await?;
        }
        info!(parent: &self.span, "Channel manager closed");
        Ok(())
    }

    async fn open_channel(&self, connection: &dyn BrokerConnection) -> Result<PooledChannel> {
        let channel = connection.create_channel().await?;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let confirms = self.config.publisher_confirms;
        if confirms {
            let events = channel.enable_confirms().await?;
            tokio::spawn(
                self.acknowledger
                    .clone()
                    .pump(key, events)
                    .instrument(self.span.clone()),
            );
        }

        debug!(parent: &self.span, channel = key, broker_channel = channel.id(), confirms, "Opened channel");
        Ok(PooledChannel { key, channel, confirms })
    }

    async fn live_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self.is_closed() {
            return Err(BusError::Shutdown);
        }
        if !self.config.automatic_recovery && self.is_lost() {
            return Err(recovery_disabled());
        }
        if self.config.recovery_mode == RecoveryMode::FailFast && self.is_recovering() {
            return Err(BusError::Connection("connection recovery in progress".to_string()));
        }

        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
        }
        if self.is_closed() {
            return Err(BusError::Shutdown);
        }

        let lost = guard.take().is_some();
        if lost {
            warn!(parent: &self.span, "Broker connection lost");
            // Channels of the dead connection are useless; dropping them also
            // ends their confirm streams.
            lock_pool(&self.idle).clear();
            if !self.config.automatic_recovery {
                self.lost.store(true, Ordering::Release);
                self.topology.forget_all();
                return Err(recovery_disabled());
            }
        }

        self.recovering.store(true, Ordering::Release);
        let result = self.establish(lost).await;
        self.recovering.store(false, Ordering::Release);

        let connection = result?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn establish(&self, recovering: bool) -> Result<Arc<dyn BrokerConnection>> {
        let max_attempts = if self.config.automatic_recovery {
            self.config.max_recovery_attempts.max(1)
        } else {
            1
        };
        let delay = self.config.recovery_interval();
        let mut attempt = 0;

        let connection = loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(connection) => break connection,
                Err(e) if e.is_recoverable() && attempt < max_attempts => {
                    let wait = with_jitter(delay);
                    warn!(
                        parent: &self.span,
                        attempt,
                        max_attempts,
                        error = %e,
                        wait_ms = wait.as_millis() as u64,
                        "Broker connection attempt failed, retrying"
                    );
                    sleep(wait).await;
                }
                Err(e) => {
                    error!(parent: &self.span, attempt, error = %e, "Giving up on broker connection");
                    return Err(e);
                }
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if recovering {
            if self.config.topology_recovery {
                let pooled = self.open_channel(connection.as_ref()).await?;
                let replayed = self.topology.replay(pooled.channel.as_ref()).await;
                lock_pool(&self.idle).push(pooled);
                if let Err(e) = replayed {
                    self.topology.forget_all();
                    error!(parent: &self.span, error = %e, "Topology replay failed");
                    return Err(e);
                }
            } else {
                self.topology.forget_all();
            }
            info!(parent: &self.span, generation, attempts = attempt, "Broker connection recovered");
        } else {
            info!(parent: &self.span, generation, "Broker connection established");
        }
        Ok(connection)
    }
}

fn recovery_disabled() -> BusError {
    BusError::Connection("connection lost and automatic recovery is disabled".to_string())
}

fn with_jitter(delay: Duration) -> Duration {
    let base = delay.as_millis() as f64;
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * base;
    Duration::from_millis((base + jitter).max(0.0) as u64)
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("generation", &self.generation())
            .field("idle_channels", &self.idle_channels())
            .field("available_leases", &self.available_leases())
            .field("recovering", &self.is_recovering())
            .finish()
    }
}
