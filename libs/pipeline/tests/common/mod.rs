#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_api::{
    Ack, BoxFuture, BridgeError, BrokerProducer, OffsetMarker, ProducerRecord, Record, RecordObserver,
    RegisteredSchema, RetryPolicy, SchemaRef, SchemaRegistry, SchemaVersion,
};
use codec_avro::{LookupConfig, SchemaCodec, StaticSchemaRegistry};
use pipeline::config::{ConsumerConfig, PipelineConfig, ProducerConfig};
use pipeline::{BridgeOptions, BridgePipeline, ObserverOptions, ObserverSink, TopicConsumer, TopicDeadLetter, TopicProducer};
use topic_engine::MemoryBroker;

pub const SOURCE: &str = "string-topic";
pub const DESTINATION: &str = "avro-topic";
pub const DEAD_LETTER: &str = "string-topic.dlq";
pub const GROUP: &str = "bridge";
pub const OBSERVER_GROUP: &str = "bridge.observer";

pub const MESSAGE_SCHEMA: &str = r#"{
    "type": "record", "name": "AvroMessage", "namespace": "org.acme.avro",
    "fields": [{"name": "id", "type": "string"}, {"name": "msg", "type": "string"}]
}"#;

// ═══════════════════════════════════════════════════════════════
//  Collaborator doubles
// ═══════════════════════════════════════════════════════════════

/// Первые `failures` вызовов produce — `TransientSend`, дальше в брокер.
pub struct FlakyProducer {
    pub inner: Arc<MemoryBroker>,
    pub failures_left: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyProducer {
    pub fn new(inner: Arc<MemoryBroker>, failures: u32) -> Arc<Self> {
        Arc::new(Self { inner, failures_left: AtomicU32::new(failures), calls: AtomicU32::new(0) })
    }
}

impl BrokerProducer for FlakyProducer {
    fn produce(&self, record: ProducerRecord) -> BoxFuture<'_, Result<Ack, BridgeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BridgeError::TransientSend("leader not available".into()));
            }
            self.inner.produce(record).await
        })
    }
}

/// Produce, который никогда не завершается.
pub struct HangingProducer;

impl BrokerProducer for HangingProducer {
    fn produce(&self, _record: ProducerRecord) -> BoxFuture<'_, Result<Ack, BridgeError>> {
        Box::pin(futures::future::pending())
    }
}

/// Registry, недоступный первые `failures` запросов.
pub struct FailingRegistry {
    pub inner: StaticSchemaRegistry,
    pub failures_left: AtomicU32,
}

impl SchemaRegistry for FailingRegistry {
    fn fetch(&self, reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(async { Err(BridgeError::SchemaUnavailable("registry returned 503".into())) });
        }
        self.inner.fetch(reference)
    }
}

#[derive(Default)]
pub struct CollectingObserver {
    pub observed: Mutex<Vec<(OffsetMarker, serde_json::Value)>>,
    pub rejected: Mutex<Vec<(OffsetMarker, String)>>,
}

impl CollectingObserver {
    pub fn observed(&self) -> Vec<(OffsetMarker, serde_json::Value)> {
        self.observed.lock().unwrap().clone()
    }

    pub fn rejected(&self) -> Vec<(OffsetMarker, String)> {
        self.rejected.lock().unwrap().clone()
    }
}

impl RecordObserver for CollectingObserver {
    fn observe(&self, record: &Record, value: &serde_json::Value) {
        self.observed.lock().unwrap().push((record.marker(), value.clone()));
    }

    fn reject(&self, record: &Record, error: &BridgeError) {
        self.rejected.lock().unwrap().push((record.marker(), error.name().to_string()));
    }
}

// ═══════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════

pub fn registry() -> StaticSchemaRegistry {
    let mut registry = StaticSchemaRegistry::new();
    registry.register(&format!("{DESTINATION}-value"), MESSAGE_SCHEMA).unwrap();
    registry
}

pub fn codec(registry: Arc<dyn SchemaRegistry>) -> Arc<SchemaCodec> {
    Arc::new(SchemaCodec::new(
        registry,
        LookupConfig { retry: RetryPolicy::new(1, Duration::from_millis(10)), timeout: Duration::from_secs(1) },
    ))
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        max_batch: 100,
        poll_timeout_ms: 50,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
    }
}

pub fn producer_config(attempts: u32) -> ProducerConfig {
    ProducerConfig { max_in_flight: 8, retry: RetryPolicy::new(attempts, Duration::from_millis(10)) }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        batch_attempts: 3,
        max_consecutive_pauses: 3,
        pause_initial_ms: 10,
        pause_max_ms: 100,
        shutdown_grace_ms: 200,
        dead_letter_topic: None,
    }
}

pub async fn broker() -> Arc<MemoryBroker> {
    broker_with_source_partitions(1).await
}

/// Source из `partitions` партиций; destination и DLQ — из одной,
/// чтобы порядок produce читался как есть.
pub async fn broker_with_source_partitions(partitions: i32) -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_topic(SOURCE, partitions).await.unwrap();
    for topic in [DESTINATION, DEAD_LETTER] {
        broker.create_topic(topic, 1).await.unwrap();
    }
    broker
}

pub async fn bridge(
    broker: &Arc<MemoryBroker>,
    producer: Arc<dyn BrokerProducer>,
    producer_attempts: u32,
    codec: Arc<SchemaCodec>,
) -> BridgePipeline {
    let consumer = TopicConsumer::subscribe(broker.clone(), SOURCE, GROUP, &consumer_config()).await.unwrap();
    let producer = Arc::new(TopicProducer::new(producer, &producer_config(producer_attempts)));
    let dlq_producer = Arc::new(TopicProducer::new(broker.clone(), &producer_config(3)));
    let dead_letter = Arc::new(TopicDeadLetter::new(dlq_producer, DEAD_LETTER));
    let options = BridgeOptions {
        name: "test-bridge".into(),
        destination_topic: DESTINATION.into(),
        schema: SchemaRef::subject(format!("{DESTINATION}-value"), SchemaVersion::Latest),
        max_batch: 100,
        pipeline: pipeline_config(),
    };
    BridgePipeline::new(consumer, producer, codec, dead_letter, options)
}

pub async fn observer(
    broker: &Arc<MemoryBroker>,
    codec: Arc<SchemaCodec>,
    observer: Arc<CollectingObserver>,
) -> ObserverSink {
    let consumer =
        TopicConsumer::subscribe(broker.clone(), DESTINATION, OBSERVER_GROUP, &consumer_config()).await.unwrap();
    let options = ObserverOptions { name: "test-observer".into(), max_batch: 100, pipeline: pipeline_config() };
    ObserverSink::new(consumer, codec, observer, options)
}

pub async fn send_json(broker: &MemoryBroker, key: &str, body: &str) {
    broker
        .produce(ProducerRecord::new(SOURCE, Some(key.to_string()), body.as_bytes().to_vec()))
        .await
        .unwrap();
}

/// Без ключа: брокер раскладывает round-robin по партициям.
pub async fn send_keyless(broker: &MemoryBroker, body: &str) {
    broker
        .produce(ProducerRecord::new(SOURCE, None, body.as_bytes().to_vec()))
        .await
        .unwrap();
}

/// Ждать условия, продвигая (виртуальное) время.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
