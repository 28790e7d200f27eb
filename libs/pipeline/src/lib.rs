//! Мост между topic'ами: JSON из source topic'а → Avro в destination topic,
//! commit offset'а только после ack, плюс ObserverSink для destination.

pub mod config;
pub mod error;
mod bridge;
mod consumer;
mod credentials;
mod dead_letter;
mod observer;
mod producer;
mod retry;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use bridge::{BridgeOptions, BridgePipeline, PipelineStats};
pub use config::{BridgeConfig, BrokerSettings, RawConfig};
pub use consumer::{ConsumerState, TopicConsumer};
pub use credentials::{Credentials, PLAIN_LOGIN_MODULE, build_auth_string};
pub use dead_letter::TopicDeadLetter;
pub use error::PipelineError;
pub use observer::{LogObserver, ObserverOptions, ObserverSink, ObserverStats};
pub use producer::{OrderingKey, TopicProducer};

pub mod headers {
    pub use crate::dead_letter::{
        HEADER_ERROR_KIND, HEADER_ERROR_MESSAGE, HEADER_SOURCE_OFFSET, HEADER_SOURCE_PARTITION,
        HEADER_SOURCE_TOPIC, HEADER_TIMESTAMP,
    };
}

// ═══════════════════════════════════════════════════════════════
//  Tasks
// ═══════════════════════════════════════════════════════════════

/// Запустить BridgePipeline отдельной задачей.
pub fn spawn_bridge(
    mut pipeline: BridgePipeline,
    token: CancellationToken,
) -> JoinHandle<Result<PipelineStats, PipelineError>> {
    tokio::spawn(async move {
        let result = pipeline.run(token).await;
        if let Err(e) = &result {
            tracing::error!(pipeline = %pipeline.name(), error = %e, "pipeline failed");
        }
        result
    })
}

/// Запустить ObserverSink отдельной задачей.
pub fn spawn_observer(
    mut sink: ObserverSink,
    token: CancellationToken,
) -> JoinHandle<Result<ObserverStats, PipelineError>> {
    tokio::spawn(async move {
        let result = sink.run(token).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "observer failed");
        }
        result
    })
}
