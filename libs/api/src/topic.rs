use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::{Ack, BridgeError, OffsetMarker, ProducerRecord, Record, RegisteredSchema, SchemaRef};

/// Boxed future, возвращаемый всеми трейтами коллабораторов.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ════════════════════════════════════════════════════════════════
//  Broker Collaborator Traits
// ════════════════════════════════════════════════════════════════

/// Запрос на чтение: позиции чтения по партициям.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub topic: String,
    /// partition → следующий offset для чтения.
    pub positions: BTreeMap<i32, i64>,
    pub max_records: usize,
    /// Сколько ждать, если данных нет (long-poll).
    pub max_wait: Duration,
}

/// Чтение из topic'а и хранение committed offsets группы.
///
/// Реализации: MemoryBroker (in-process), Kafka client adapter.
pub trait BrokerConsumer: Send + Sync {
    /// Количество партиций topic'а.
    fn partitions(&self, topic: &str) -> BoxFuture<'_, Result<i32, BridgeError>>;

    /// Последние закоммиченные маркеры группы (inclusive) по партициям.
    fn committed(&self, topic: &str, group: &str)
        -> BoxFuture<'_, Result<BTreeMap<i32, i64>, BridgeError>>;

    /// Прочитать до `max_records` записей начиная с позиций запроса.
    /// Пустой результат = таймаут ожидания, не ошибка.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<Vec<Record>, BridgeError>>;

    /// Зафиксировать маркер для группы.
    fn commit(&self, topic: &str, group: &str, marker: OffsetMarker)
        -> BoxFuture<'_, Result<(), BridgeError>>;
}

/// Публикация записей. Ошибки: `TransientSend` (можно повторить)
/// или `Delivery` (повторять бессмысленно).
pub trait BrokerProducer: Send + Sync {
    fn produce(&self, record: ProducerRecord) -> BoxFuture<'_, Result<Ack, BridgeError>>;
}

// ════════════════════════════════════════════════════════════════
//  Schema Registry
// ════════════════════════════════════════════════════════════════

/// Источник определений схем по id или subject/version.
pub trait SchemaRegistry: Send + Sync {
    fn fetch(&self, reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>>;
}

// ════════════════════════════════════════════════════════════════
//  Pipeline Sinks
// ════════════════════════════════════════════════════════════════

/// Изоляция poison-сообщений.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter<'a>(&'a self, record: &'a Record, error: &'a BridgeError)
        -> BoxFuture<'a, Result<(), BridgeError>>;
}

/// Получатель декодированных записей ObserverSink'а (лог, метрика, test hook).
pub trait RecordObserver: Send + Sync {
    fn observe(&self, record: &Record, value: &serde_json::Value);

    /// Запись не удалось декодировать. По умолчанию ничего не делает.
    fn reject(&self, _record: &Record, _error: &BridgeError) {}
}
