//! Connection manager for the build broker.
//!
//! A [`BuildQueue`] owns at most one live [`BrokerChannel`]. Connection
//! attempts are serialized; transport failures drop the channel and schedule
//! a reconnect after `attempt * reconnect_delay`. Once the reconnect budget is
//! spent the queue enters [`ConnectionState::Failed`] and the injected
//! [`FatalHandler`] runs.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("channel unavailable")]
    ChannelUnavailable,
    #[error("broker unrecoverable after {0} reconnect attempts")]
    Unrecoverable(u32),
    #[error("queue closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("broker {0} timed out")]
    Timeout(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
    pub content_type: &'static str,
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a connection and channel. The connector reports later transport
    /// failures through `failure`.
    async fn connect(&self, failure: FailureSignal) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Invoked once when the reconnect budget is exhausted. Must not call back
/// into the queue.
pub type FatalHandler = Arc<dyn Fn(&BrokerError) + Send + Sync>;

/// Production handler: the process exits so a supervisor can restart it.
pub fn exit_process() -> FatalHandler {
    Arc::new(|err: &BrokerError| {
        tracing::error!(error = %err, "Build broker unrecoverable, exiting");
        std::process::exit(1);
    })
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub operation_timeout: Duration,
}

/// Handle given to a connector so it can report a dead connection. Signals
/// from a connection that has already been replaced are ignored.
#[derive(Clone)]
pub struct FailureSignal {
    shared: Weak<Shared>,
    generation: u64,
}

impl FailureSignal {
    pub fn raise(&self, reason: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_failure(self.generation, reason);
        }
    }
}

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
    // Bumped after every finished connection attempt.
    epoch: u64,
    attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    closed: bool,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    settings: QueueSettings,
    fatal: FatalHandler,
    inner: Mutex<Inner>,
    connect_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct BuildQueue {
    shared: Arc<Shared>,
}

impl BuildQueue {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: QueueSettings, fatal: FatalHandler) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                fatal,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    channel: None,
                    generation: 0,
                    epoch: 0,
                    attempts: 0,
                    reconnect_task: None,
                    closed: false,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect if not already connected. Callers arriving while an attempt is
    /// in flight wait for it and share its outcome.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.shared.connect().await
    }

    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.shared.channel().await.map(|(channel, _)| channel)
    }

    /// Publish a persistent, timestamped message.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError> {
        let (channel, generation) = self.shared.channel().await?;
        let options = PublishOptions {
            persistent: true,
            timestamp: Utc::now(),
            content_type: "application/json",
        };

        let result = tokio::time::timeout(
            self.shared.settings.operation_timeout,
            channel.publish(exchange, routing_key, payload, &options),
        )
        .await
        .unwrap_or(Err(BrokerError::Timeout("publish")));

        if let Err(e) = &result {
            self.shared.handle_failure(generation, &e.to_string());
        }
        result
    }

    /// Cancel any pending reconnect and close the channel. Later calls fail
    /// with [`BrokerError::Closed`].
    pub async fn close(&self) {
        let channel = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.generation += 1;
            if inner.state != ConnectionState::Failed {
                inner.state = ConnectionState::Disconnected;
            }
            inner.channel.take()
        };

        if let Some(channel) = channel {
            match tokio::time::timeout(self.shared.settings.operation_timeout, channel.close()).await {
                Ok(Ok(())) => tracing::info!("Build broker channel closed"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Error closing build broker channel"),
                Err(_) => tracing::warn!("Timed out closing build broker channel"),
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn usable(&self, inner: &Inner) -> Result<Option<(Arc<dyn BrokerChannel>, u64)>, BrokerError> {
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        match (&inner.state, &inner.channel) {
            (ConnectionState::Failed, _) => Err(BrokerError::Unrecoverable(
                self.settings.max_reconnect_attempts,
            )),
            (ConnectionState::Connected, Some(channel)) => Ok(Some((channel.clone(), inner.generation))),
            _ => Ok(None),
        }
    }

    async fn channel(self: &Arc<Self>) -> Result<(Arc<dyn BrokerChannel>, u64), BrokerError> {
        {
            let inner = self.lock();
            if let Some(live) = self.usable(&inner)? {
                return Ok(live);
            }
            if inner.reconnect_task.is_some() {
                return Err(BrokerError::ChannelUnavailable);
            }
        }

        if let Err(e) = self.connect().await {
            tracing::debug!(error = %e, "Lazy broker connect failed");
            return Err(match e {
                BrokerError::Closed | BrokerError::Unrecoverable(_) => e,
                _ => BrokerError::ChannelUnavailable,
            });
        }

        let inner = self.lock();
        self.usable(&inner)?.ok_or(BrokerError::ChannelUnavailable)
    }

    async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        let observed_epoch = {
            let inner = self.lock();
            if self.usable(&inner)?.is_some() {
                return Ok(());
            }
            inner.epoch
        };

        let _serial = self.connect_lock.lock().await;

        let generation = {
            let mut inner = self.lock();
            if self.usable(&inner)?.is_some() {
                return Ok(());
            }
            if inner.epoch != observed_epoch {
                // An attempt finished while we waited and it did not connect.
                return Err(BrokerError::ChannelUnavailable);
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.generation
        };

        let signal = FailureSignal {
            shared: Arc::downgrade(self),
            generation,
        };
        let result = tokio::time::timeout(self.settings.operation_timeout, self.connector.connect(signal))
            .await
            .unwrap_or(Err(BrokerError::Timeout("connect")));

        let orphan = {
            let mut inner = self.lock();
            inner.epoch += 1;
            match result {
                Ok(channel) if inner.closed || inner.generation != generation => Some(channel),
                Ok(channel) => {
                    let attempts = std::mem::take(&mut inner.attempts);
                    inner.channel = Some(channel);
                    inner.state = ConnectionState::Connected;
                    tracing::info!(after_attempts = attempts, "Connected to build broker");
                    return Ok(());
                }
                Err(e) => {
                    if inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Disconnected;
                    }
                    tracing::warn!(error = %e, attempt = inner.attempts, "Build broker connection attempt failed");
                    self.schedule_reconnect(&mut inner);
                    return Err(e);
                }
            }
        };

        if let Some(channel) = orphan {
            let _ = channel.close().await;
        }
        Err(BrokerError::Closed)
    }

    fn handle_failure(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.closed || inner.generation != generation || inner.state != ConnectionState::Connected {
            return;
        }
        if let Some(channel) = inner.channel.take() {
            let timeout = self.settings.operation_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, channel.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "Error closing lost build broker channel"),
                    Err(_) => tracing::debug!("Timed out closing lost build broker channel"),
                }
            });
        }
        inner.state = ConnectionState::Disconnected;
        inner.generation += 1;
        tracing::warn!(reason, "Build broker connection lost");
        self.schedule_reconnect(&mut inner);
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.closed || inner.reconnect_task.is_some() || inner.state == ConnectionState::Failed {
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let max = self.settings.max_reconnect_attempts;
        if attempt > max {
            inner.state = ConnectionState::Failed;
            let err = BrokerError::Unrecoverable(max);
            tracing::error!(attempts = max, "Build broker reconnect budget exhausted");
            (self.fatal)(&err);
            return;
        }

        let delay = self.settings.reconnect_delay * attempt;
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling build broker reconnect");

        let shared = Arc::clone(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.lock().reconnect_task = None;
            if let Err(e) = shared.connect().await {
                tracing::debug!(attempt, error = %e, "Scheduled build broker reconnect failed");
            }
        }));
    }
}
