use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bridge_api::{BrokerProducer, ProducerRecord};
use codec_avro::SchemaCodec;
use pipeline::{
    BridgeConfig, BridgeOptions, BridgePipeline, LogObserver, ObserverOptions, ObserverSink,
    TopicConsumer, TopicDeadLetter, TopicProducer, spawn_bridge, spawn_observer,
};
use topic_engine::MemoryBroker;

use crate::config::{ServeArgs, effective};
use crate::error::ServerError;

use super::registry;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("topic-bridge starting");

    // --- Load config ---
    let config = effective(&args)?;
    log_settings(&config);

    let codec = Arc::new(SchemaCodec::new(registry::build(&config)?, config.schema.lookup_config()));

    // --- Local broker ---
    let broker = Arc::new(MemoryBroker::new());
    let dead_letter_topic = config.dead_letter_topic();
    for topic in [&config.source_topic, &config.destination_topic, &dead_letter_topic] {
        broker.create_topic(topic, args.partitions).await?;
    }

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Bridge ---
    let producer = Arc::new(TopicProducer::new(broker.clone(), &config.producer));
    let dead_letter = Arc::new(TopicDeadLetter::new(producer.clone(), &dead_letter_topic));
    let consumer = TopicConsumer::subscribe(
        broker.clone(),
        &config.source_topic,
        &config.source_group_id,
        &config.consumer,
    )
    .await?;
    let bridge = BridgePipeline::new(consumer, producer, codec.clone(), dead_letter, BridgeOptions::from_config(&config));
    let mut bridge_handle = spawn_bridge(bridge, token.clone());

    // --- Observer ---
    let observer_handle = if config.observer.enabled {
        let consumer = TopicConsumer::subscribe(
            broker.clone(),
            &config.destination_topic,
            config.observer_group(),
            &config.observer_consumer(),
        )
        .await?;
        let sink = ObserverSink::new(consumer, codec, Arc::new(LogObserver), ObserverOptions::from_config(&config));
        Some(spawn_observer(sink, token.clone()))
    } else {
        None
    };

    // --- stdin → source topic ---
    let mut feeder = spawn_stdin_feeder(broker.clone(), config.source_topic.clone(), token.clone());
    tracing::info!(topic = %config.source_topic, "bridge ready, reading JSON lines from stdin");

    let grace = config.pipeline.shutdown_grace();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
        }
        fed = &mut feeder => {
            let lines = fed??;
            tracing::info!(lines, "stdin closed, draining");
            let mut groups = vec![(config.source_topic.as_str(), config.source_group_id.clone())];
            if observer_handle.is_some() {
                groups.push((config.destination_topic.as_str(), config.observer_group()));
            }
            if !drain(&broker, &groups, grace).await {
                tracing::warn!(?grace, "records left uncommitted after grace period");
            }
        }
        stopped = &mut bridge_handle => {
            // pipeline остановился сам: эскалация ошибки
            token.cancel();
            stopped??;
            return Ok(());
        }
    }

    // Signal all tasks to stop cooperatively
    token.cancel();
    if !feeder.is_finished() {
        feeder.abort();
    }

    let bridge_stats = join_within(bridge_handle, grace, "bridge").await.transpose()?;
    if let Some(stats) = bridge_stats {
        tracing::info!(?stats, "bridge stats");
    }
    if let Some(handle) = observer_handle {
        if let Some(stats) = join_within(handle, grace, "observer").await.transpose()? {
            tracing::info!(?stats, "observer stats");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn log_settings(config: &BridgeConfig) {
    let settings = config.broker_settings();
    tracing::info!(
        bootstrap_servers = %settings.bootstrap_servers,
        security_protocol = settings.security_protocol,
        sasl_mechanism = settings.sasl_mechanism,
        api_key = %settings.credentials.key(),
        properties = ?settings.client_properties(Some(&config.source_group_id)).keys().collect::<Vec<_>>(),
        "broker settings"
    );
    tracing::info!(
        url = %config.schema_registry_url,
        api_key = %config.registry_credentials.key(),
        schema = %config.destination_schema(),
        properties = ?config.registry_properties().keys().collect::<Vec<_>>(),
        "schema registry settings"
    );
}

/// Каждая непустая строка stdin → запись в source topic. Возвращает
/// число отправленных строк при EOF.
fn spawn_stdin_feeder(
    broker: Arc<MemoryBroker>,
    topic: String,
    token: CancellationToken,
) -> JoinHandle<std::io::Result<u64>> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut sent = 0u64;
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = token.cancelled() => break,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match broker.produce(ProducerRecord::new(&topic, None, line.as_bytes().to_vec())).await {
                Ok(ack) => {
                    sent += 1;
                    tracing::debug!(topic = %topic, partition = ack.partition, offset = ack.offset, "line published");
                }
                Err(e) => tracing::error!(topic = %topic, error = %e, "publish error"),
            }
        }
        Ok(sent)
    })
}

/// Ждать, пока группы закоммитят всё, что лежит в их topic'ах.
async fn drain(broker: &MemoryBroker, groups: &[(&str, String)], grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let mut done = true;
        for (topic, group) in groups {
            let Ok(records) = broker.records(topic).await else {
                continue;
            };
            let mut last: BTreeMap<i32, i64> = BTreeMap::new();
            for record in &records {
                last.insert(record.partition(), record.offset());
            }
            for (partition, offset) in last {
                if broker.committed_offset(topic, group, partition).await.is_none_or(|c| c < offset) {
                    done = false;
                }
            }
        }
        if done {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Дождаться задачи не дольше `grace`, иначе abort. `None` — задача прервана.
async fn join_within<T>(
    mut handle: JoinHandle<Result<T, pipeline::PipelineError>>,
    grace: Duration,
    name: &str,
) -> Option<Result<T, ServerError>> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(result)) => Some(result.map_err(ServerError::from)),
        Ok(Err(e)) => Some(Err(ServerError::from(e))),
        Err(_) => {
            tracing::warn!(task = name, ?grace, "task did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}
