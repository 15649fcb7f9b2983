//! Build dispatch: persist a build request, then hand it to the broker.

pub mod broker;
pub mod nats;

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

pub use broker::{
    exit_process, BrokerChannel, BrokerConnector, BrokerError, BuildQueue, ConnectionState,
    FailureSignal, FatalHandler, PublishOptions, QueueSettings,
};
pub use nats::NatsConnector;

use crate::models::build::BuildRequest;
use crate::store::{CredentialStore, StoreError};

pub const BUILD_EXCHANGE: &str = "obtura.builds";
pub const BUILD_ROUTING_KEY: &str = "build.triggered";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to record build: {0}")]
    Store(#[from] StoreError),
    #[error("failed to enqueue build: {0}")]
    Queue(#[from] BrokerError),
}

#[derive(Clone)]
pub struct BuildDispatcher {
    store: Arc<dyn CredentialStore>,
    queue: BuildQueue,
}

impl BuildDispatcher {
    pub fn new(store: Arc<dyn CredentialStore>, queue: BuildQueue) -> Self {
        Self { store, queue }
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    /// Record the build as `PENDING` and publish it. The row is the system of
    /// record; if publishing fails it is marked `FAILED`.
    pub async fn dispatch(&self, request: BuildRequest) -> Result<Uuid, DispatchError> {
        self.store.insert_pending_build(&request).await?;

        let payload = serde_json::to_vec(&request.message())
            .map(Bytes::from)
            .map_err(|e| BrokerError::Publish(format!("failed to encode build message: {e}")));

        let published = match payload {
            Ok(payload) => {
                self.queue
                    .publish(BUILD_EXCHANGE, BUILD_ROUTING_KEY, payload)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            tracing::warn!(
                build_id = %request.build_id,
                project_id = %request.project_id,
                error = %e,
                "Build publish failed"
            );
            if let Err(store_err) = self
                .store
                .mark_build_failed(request.build_id, &e.to_string())
                .await
            {
                tracing::error!(build_id = %request.build_id, error = %store_err, "Failed to mark build as failed");
            }
            return Err(e.into());
        }

        tracing::info!(
            build_id = %request.build_id,
            project_id = %request.project_id,
            branch = %request.branch,
            trigger = request.trigger.as_str(),
            "Build dispatched"
        );
        Ok(request.build_id)
    }
}
