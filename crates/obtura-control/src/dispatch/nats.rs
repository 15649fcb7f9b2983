//! NATS JetStream transport for build dispatch.
//!
//! Exchange and routing key combine into the subject
//! `<exchange>.<routing_key>`, captured by a file-backed stream. Workers pull
//! from a durable consumer whose `max_ack_pending` is the prefetch limit.

use std::sync::Arc;

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;

use super::broker::{BrokerChannel, BrokerConnector, BrokerError, FailureSignal, PublishOptions};
use crate::config::BrokerConfig;

pub const BUILD_STREAM: &str = "OBTURA_BUILDS";
pub const BUILD_WORKER_CONSUMER: &str = "build-workers";
pub const TIMESTAMP_HEADER: &str = "Obtura-Timestamp";

pub struct NatsConnector {
    config: BrokerConfig,
    subjects: Vec<String>,
}

impl NatsConnector {
    pub fn new(config: BrokerConfig, exchange: &str) -> Self {
        Self {
            config,
            subjects: vec![format!("{exchange}.>")],
        }
    }

    async fn ensure_topology(&self, js: &jetstream::Context) -> Result<(), BrokerError> {
        let stream = match js.get_stream(BUILD_STREAM).await {
            Ok(stream) => stream,
            Err(_) => js
                .create_stream(jetstream::stream::Config {
                    name: BUILD_STREAM.to_string(),
                    subjects: self.subjects.clone(),
                    storage: jetstream::stream::StorageType::File,
                    retention: jetstream::stream::RetentionPolicy::WorkQueue,
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::Connect(format!("failed to create stream {BUILD_STREAM}: {e}")))?,
        };

        stream
            .get_or_create_consumer(
                BUILD_WORKER_CONSUMER,
                jetstream::consumer::pull::Config {
                    durable_name: Some(BUILD_WORKER_CONSUMER.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_ack_pending: i64::from(self.config.prefetch),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BrokerError::Connect(format!("failed to create consumer {BUILD_WORKER_CONSUMER}: {e}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self, failure: FailureSignal) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let url = self.config.url();
        let client = async_nats::ConnectOptions::with_user_and_password(
            self.config.user.clone(),
            self.config.password.clone(),
        )
        .name("obtura-control")
        .ping_interval(self.config.heartbeat)
        .connection_timeout(self.config.operation_timeout)
        .event_callback(move |event| {
            let failure = failure.clone();
            async move {
                match &event {
                    async_nats::Event::Disconnected | async_nats::Event::Closed => {
                        failure.raise(&event.to_string());
                    }
                    async_nats::Event::ClientError(e) => failure.raise(&e.to_string()),
                    other => tracing::debug!(event = %other, "NATS connection event"),
                }
            }
        })
        .connect(url.as_str())
        .await
        .map_err(|e| BrokerError::Connect(format!("failed to connect to NATS at {url}: {e}")))?;

        let js = match self.config.domain() {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };
        self.ensure_topology(&js).await?;

        tracing::info!(url = %url, stream = BUILD_STREAM, "Build broker topology ready");
        Ok(Arc::new(NatsChannel { client, js }))
    }
}

pub struct NatsChannel {
    client: async_nats::Client,
    js: jetstream::Context,
}

#[async_trait]
impl BrokerChannel for NatsChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        let subject = format!("{exchange}.{routing_key}");
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, options.timestamp.to_rfc3339().as_str());
        headers.insert("Content-Type", options.content_type);

        if options.persistent {
            let ack = self
                .js
                .publish_with_headers(subject, headers, payload)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            ack.await.map_err(|e| BrokerError::Publish(e.to_string()))?;
        } else {
            self.client
                .publish_with_headers(subject, headers, payload)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    /// Flush pending publishes, then drain so the connection is released
    /// even while other clones of the client are still alive.
    async fn close(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Publish(format!("flush on close failed: {e}")))?;
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Publish(format!("drain on close failed: {e}")))
    }
}
