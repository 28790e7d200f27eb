use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use bridge_api::{Ack, BridgeError, BrokerProducer, ProducerRecord, RetryPolicy};

use crate::config::ProducerConfig;
use crate::retry::{RetryError, with_retry};

type Lane = Arc<tokio::sync::Mutex<()>>;

/// По чему упорядочиваются send'ы: одна lane → один send в полёте.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderingKey {
    /// Ключ записи.
    Key(String),
    /// Партиция источника: для записей без ключа.
    SourcePartition(i32),
}

impl OrderingKey {
    /// Ключ записи, а без ключа — партиция, из которой она прочитана.
    pub fn for_source(key: Option<&str>, partition: i32) -> Self {
        match key {
            Some(key) => OrderingKey::Key(key.to_string()),
            None => OrderingKey::SourcePartition(partition),
        }
    }
}

/// Публикация с ожиданием ack.
///
/// - `TransientSend` повторяется с backoff до `retry.max_attempts`,
///   дальше `Delivery { retries_exhausted: true }`;
/// - send'ы одной `OrderingKey` идут строго по одному (FIFO lane),
///   так повтор не обгоняет следующую запись той же lane;
/// - все send'ы вместе ограничены `max_in_flight`.
pub struct TopicProducer {
    broker: Arc<dyn BrokerProducer>,
    retry: RetryPolicy,
    in_flight: Semaphore,
    lanes: Mutex<HashMap<OrderingKey, Lane>>,
}

impl TopicProducer {
    pub fn new(broker: Arc<dyn BrokerProducer>, config: &ProducerConfig) -> Self {
        Self {
            broker,
            retry: config.retry,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lane(&self, ordering: &OrderingKey) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes.entry(ordering.clone()).or_default().clone()
    }

    /// Убрать lane, если кроме map и вызывающего его никто не держит.
    fn release_lane(&self, ordering: &OrderingKey, lane: Lane) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::strong_count(&lane) == 2 {
            lanes.remove(ordering);
        }
    }

    /// Отправить запись и дождаться ack. Записи с ключом упорядочены
    /// по ключу, без ключа — не упорядочены.
    pub async fn send(&self, record: ProducerRecord) -> Result<Ack, BridgeError> {
        match record.key.clone() {
            Some(key) => self.send_ordered(OrderingKey::Key(key), record).await,
            None => self.send_unordered(record).await,
        }
    }

    /// Отправить в FIFO lane `ordering`: предыдущий send этой lane
    /// (вместе с его ретраями) завершается раньше.
    pub async fn send_ordered(&self, ordering: OrderingKey, record: ProducerRecord) -> Result<Ack, BridgeError> {
        let lane = self.lane(&ordering);
        let result = {
            let _turn = lane.lock().await;
            self.send_unordered(record).await
        };
        self.release_lane(&ordering, lane);
        result
    }

    async fn send_unordered(&self, record: ProducerRecord) -> Result<Ack, BridgeError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| BridgeError::Cancelled)?;
        let broker = &self.broker;
        let record = &record;
        let result = with_retry(&self.retry, "produce", || broker.produce(record.clone())).await;
        match result {
            Ok(ack) => {
                tracing::trace!(topic = %record.topic, partition = ack.partition, offset = ack.offset, "acked");
                Ok(ack)
            }
            Err(RetryError::Permanent(e)) => Err(e),
            Err(RetryError::Exhausted { last, attempts }) => {
                tracing::error!(topic = %record.topic, attempts, error = %last, "send retries exhausted");
                Err(BridgeError::Delivery {
                    message: format!("{attempts} attempts: {last}"),
                    retries_exhausted: true,
                })
            }
        }
    }

    /// Число живых per-key lane'ов.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use bridge_api::BoxFuture;

    use super::*;

    /// Брокер: первые `failures` попыток каждой записи — `TransientSend`.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        attempts: Mutex<HashMap<Vec<u8>, u32>>,
        log: Mutex<Vec<Vec<u8>>>,
        calls: AtomicU32,
    }

    impl BrokerProducer for Flaky {
        fn produce(&self, record: ProducerRecord) -> BoxFuture<'_, Result<Ack, BridgeError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                let attempt = {
                    let mut attempts = self.attempts.lock().unwrap();
                    let n = attempts.entry(record.payload.clone()).or_default();
                    *n += 1;
                    *n
                };
                if attempt <= self.failures {
                    return Err(BridgeError::TransientSend("not enough replicas".into()));
                }
                let mut log = self.log.lock().unwrap();
                log.push(record.payload);
                Ok(Ack { partition: 0, offset: log.len() as i64 - 1 })
            })
        }
    }

    fn producer(broker: Arc<Flaky>, attempts: u32) -> TopicProducer {
        TopicProducer::new(
            broker,
            &ProducerConfig {
                max_in_flight: 4,
                retry: RetryPolicy::new(attempts, Duration::from_millis(10)),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_single_delivery() {
        let broker = Arc::new(Flaky { failures: 3, ..Flaky::default() });
        let producer = producer(broker.clone(), 5);

        let ack = producer.send(ProducerRecord::new("t", Some("k".into()), b"a".to_vec())).await.unwrap();
        assert_eq!(ack.offset, 0);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*broker.log.lock().unwrap(), vec![b"a".to_vec()]);
        assert_eq!(producer.active_lanes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_marked() {
        let broker = Arc::new(Flaky { failures: 10, ..Flaky::default() });
        let producer = producer(broker.clone(), 3);

        let err = producer.send(ProducerRecord::new("t", None, b"a".to_vec())).await.unwrap_err();
        assert!(matches!(err, BridgeError::Delivery { retries_exhausted: true, .. }));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_order_survives_retries() {
        // каждая запись падает дважды; без lane вторая обогнала бы первую
        let broker = Arc::new(Flaky { failures: 2, ..Flaky::default() });
        let producer = producer(broker.clone(), 5);

        let sends = (0u8..5).map(|i| producer.send(ProducerRecord::new("t", Some("k".into()), vec![i])));
        let results = futures::future::join_all(sends).await;
        assert!(results.iter().all(Result::is_ok));

        let log = broker.log.lock().unwrap().clone();
        assert_eq!(log, (0u8..5).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn keyless_records_keep_source_partition_order() {
        let broker = Arc::new(Flaky { failures: 1, ..Flaky::default() });
        let producer = producer(broker.clone(), 5);

        let sends = (0u8..4).map(|i| {
            let ordering = OrderingKey::for_source(None, 0);
            producer.send_ordered(ordering, ProducerRecord::new("t", None, vec![i]))
        });
        let results = futures::future::join_all(sends).await;
        assert!(results.iter().all(Result::is_ok));

        let log = broker.log.lock().unwrap().clone();
        assert_eq!(log, (0u8..4).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(producer.active_lanes(), 0);
    }

    #[test]
    fn ordering_prefers_record_key() {
        assert_eq!(OrderingKey::for_source(Some("k"), 3), OrderingKey::Key("k".into()));
        assert_eq!(OrderingKey::for_source(None, 3), OrderingKey::SourcePartition(3));
    }
}
