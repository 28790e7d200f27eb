pub mod error;

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use bridge_api::{
    Ack, BoxFuture, BridgeError, BrokerConsumer, BrokerProducer, FetchRequest, OffsetMarker,
    ProducerRecord, Record,
};

pub use error::TopicError;

/// Лимит размера сообщения по умолчанию (как `message.max.bytes` у Kafka).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// Именованный append-only лог из N партиций.
///
/// Читатели ждут новых записей через `Notify` (long-poll).
pub struct Topic {
    pub name: String,
    partitions: Vec<Mutex<Vec<Record>>>,
    notify: Notify,
    round_robin: AtomicUsize,
    /// С какой партиции начинает следующий fetch.
    fetch_cursor: AtomicUsize,
}

impl Topic {
    pub fn new(name: String, partitions: i32) -> Result<Self, TopicError> {
        if partitions <= 0 {
            return Err(TopicError::InvalidPartitions { topic: name, partitions });
        }
        Ok(Self {
            name,
            partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
            notify: Notify::new(),
            round_robin: AtomicUsize::new(0),
            fetch_cursor: AtomicUsize::new(0),
        })
    }

    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    /// Партиция по ключу: одинаковый ключ → одна партиция (порядок по ключу).
    /// Записи без ключа распределяются round-robin.
    fn partition_for(&self, key: Option<&str>) -> usize {
        let n = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Дописать запись в лог: append → notify всех ожидающих читателей.
    pub async fn append(&self, record: ProducerRecord) -> Ack {
        let partition = self.partition_for(record.key.as_deref());
        let offset = {
            let mut log = self.partitions[partition].lock().await;
            let offset = log.len() as i64;
            log.push(Record::new(
                self.name.clone(),
                OffsetMarker::new(partition as i32, offset),
                record.key,
                record.payload,
                record.headers,
            ));
            offset
        };
        self.notify.notify_waiters();
        Ack { partition: partition as i32, offset }
    }

    /// Прочитать записи начиная с позиций, не больше `max` суммарно.
    ///
    /// `max` делится между партициями с backlog'ом поровну, недобранная
    /// доля уходит остальным. Стартовая партиция сдвигается с каждым
    /// вызовом, так что при `max` меньше числа партиций ни одна не голодает.
    async fn read(&self, positions: &BTreeMap<i32, i64>, max: usize) -> Vec<Record> {
        let n = self.partitions.len();
        let start = self.fetch_cursor.fetch_add(1, Ordering::Relaxed) % n;

        // все lock'и в порядке индексов
        let mut logs = Vec::with_capacity(n);
        for partition in &self.partitions {
            logs.push(partition.lock().await);
        }
        let from: Vec<usize> = (0..n)
            .map(|idx| positions.get(&(idx as i32)).copied().unwrap_or(0).max(0) as usize)
            .collect();
        let mut available: Vec<usize> =
            logs.iter().zip(&from).map(|(log, &from)| log.len().saturating_sub(from)).collect();

        let mut quota = vec![0usize; n];
        let mut remaining = max;
        while remaining > 0 {
            let active = available.iter().filter(|&&a| a > 0).count();
            if active == 0 {
                break;
            }
            let share = (remaining / active).max(1);
            for idx in (0..n).map(|i| (start + i) % n) {
                let take = share.min(available[idx]).min(remaining);
                quota[idx] += take;
                available[idx] -= take;
                remaining -= take;
            }
        }

        let mut out = Vec::with_capacity(max - remaining);
        for idx in (0..n).map(|i| (start + i) % n) {
            if quota[idx] > 0 {
                out.extend(logs[idx][from[idx]..from[idx] + quota[idx]].iter().cloned());
            }
        }
        out
    }

    /// Все записи topic'а, партиция за партицией.
    pub async fn snapshot(&self) -> Vec<Record> {
        let mut out = Vec::new();
        for partition in &self.partitions {
            out.extend(partition.lock().await.iter().cloned());
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-process брокер: реестр topic'ов + committed offsets групп.
/// Реализует BrokerConsumer и BrokerProducer.
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// (group, topic) → partition → последний закоммиченный offset.
    committed: Mutex<HashMap<(String, String), BTreeMap<i32, i64>>>,
    max_message_bytes: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            max_message_bytes,
        }
    }

    pub async fn create_topic(&self, name: &str, partitions: i32) -> Result<(), TopicError> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(TopicError::AlreadyExists(name.to_string()));
        }
        let topic = Topic::new(name.to_string(), partitions)?;
        topics.insert(name.to_string(), Arc::new(topic));
        tracing::info!(topic = %name, partitions, "created topic");
        Ok(())
    }

    pub async fn topic(&self, name: &str) -> Result<Arc<Topic>, TopicError> {
        self.topics
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| TopicError::NotFound(name.to_string()))
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// Все записи topic'а (для инспекции и тестов).
    pub async fn records(&self, topic: &str) -> Result<Vec<Record>, TopicError> {
        Ok(self.topic(topic).await?.snapshot().await)
    }

    /// Закоммиченный offset группы в партиции.
    pub async fn committed_offset(&self, topic: &str, group: &str, partition: i32) -> Option<i64> {
        self.committed
            .lock()
            .await
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|offsets| offsets.get(&partition).copied())
    }

    async fn publish(&self, record: ProducerRecord) -> Result<Ack, TopicError> {
        if record.payload.len() > self.max_message_bytes {
            return Err(TopicError::MessageTooLarge {
                size: record.payload.len(),
                limit: self.max_message_bytes,
            });
        }
        let topic = self.topic(&record.topic).await?;
        Ok(topic.append(record).await)
    }

    async fn long_poll(&self, request: FetchRequest) -> Result<Vec<Record>, TopicError> {
        let topic = self.topic(&request.topic).await?;
        let deadline = Instant::now() + request.max_wait;
        loop {
            // Подписаться на notify ДО чтения, чтобы не потерять append между ними.
            let notified = topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = topic.read(&request.positions, request.max_records).await;
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

impl BrokerProducer for MemoryBroker {
    fn produce(&self, record: ProducerRecord) -> BoxFuture<'_, Result<Ack, BridgeError>> {
        Box::pin(async move { self.publish(record).await.map_err(TopicError::into_delivery_error) })
    }
}

impl BrokerConsumer for MemoryBroker {
    fn partitions(&self, topic: &str) -> BoxFuture<'_, Result<i32, BridgeError>> {
        let topic_name = topic.to_string();
        Box::pin(async move {
            let t = self.topic(&topic_name).await.map_err(TopicError::into_fetch_error)?;
            Ok(t.partition_count())
        })
    }

    fn committed(&self, topic: &str, group: &str)
        -> BoxFuture<'_, Result<BTreeMap<i32, i64>, BridgeError>>
    {
        let key = (group.to_string(), topic.to_string());
        Box::pin(async move {
            Ok(self.committed.lock().await.get(&key).cloned().unwrap_or_default())
        })
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<Vec<Record>, BridgeError>> {
        Box::pin(async move { self.long_poll(request).await.map_err(TopicError::into_fetch_error) })
    }

    fn commit(&self, topic: &str, group: &str, marker: OffsetMarker)
        -> BoxFuture<'_, Result<(), BridgeError>>
    {
        let key = (group.to_string(), topic.to_string());
        Box::pin(async move {
            self.committed
                .lock()
                .await
                .entry(key)
                .or_default()
                .insert(marker.partition, marker.offset);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fetch_all(topic: &str, partitions: i32) -> FetchRequest {
        FetchRequest {
            topic: topic.into(),
            positions: (0..partitions).map(|p| (p, 0)).collect(),
            max_records: 100,
            max_wait: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn same_key_lands_in_same_partition_in_order() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 4).await.unwrap();

        let mut acks = Vec::new();
        for i in 0..5 {
            let rec = ProducerRecord::new("orders", Some("k1".into()), vec![i]);
            acks.push(broker.produce(rec).await.unwrap());
        }
        assert!(acks.iter().all(|a| a.partition == acks[0].partition));
        let offsets: Vec<i64> = acks.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn oversized_message_is_a_delivery_error() {
        let broker = MemoryBroker::with_max_message_bytes(4);
        broker.create_topic("t", 1).await.unwrap();
        let err = broker
            .produce(ProducerRecord::new("t", None, vec![0; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Delivery { retries_exhausted: false, .. }));
    }

    #[tokio::test]
    async fn unknown_topic_fetch_is_broker_unavailable() {
        let broker = MemoryBroker::new();
        let err = broker.fetch(fetch_all("missing", 1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::BrokerUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_empty() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 2).await.unwrap();
        let records = broker.fetch(fetch_all("t", 2)).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn fetch_wakes_up_on_append() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("t", 1).await.unwrap();

        let reader = broker.clone();
        let handle = tokio::spawn(async move {
            let mut req = fetch_all("t", 1);
            req.max_wait = Duration::from_secs(5);
            reader.fetch(req).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker
            .produce(ProducerRecord::new("t", Some("a".into()), b"x".to_vec()))
            .await
            .unwrap();

        let records = handle.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload(), b"x");
        assert_eq!(records[0].marker(), OffsetMarker::new(0, 0));
    }

    fn per_partition(records: &[Record]) -> BTreeMap<i32, Vec<i64>> {
        let mut out: BTreeMap<i32, Vec<i64>> = BTreeMap::new();
        for record in records {
            out.entry(record.partition()).or_default().push(record.offset());
        }
        out
    }

    #[tokio::test]
    async fn fetch_shares_max_records_between_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 2).await.unwrap();
        // без ключа: round-robin, по 5 записей в партицию
        for i in 0..10u8 {
            broker.produce(ProducerRecord::new("t", None, vec![i])).await.unwrap();
        }

        let mut req = fetch_all("t", 2);
        req.max_records = 4;
        let got = per_partition(&broker.fetch(req).await.unwrap());
        assert_eq!(got.get(&0), Some(&vec![0, 1]));
        assert_eq!(got.get(&1), Some(&vec![0, 1]));
    }

    #[tokio::test]
    async fn short_partition_leaves_its_share_to_others() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 2).await.unwrap();
        for i in 0..10u8 {
            broker.produce(ProducerRecord::new("t", None, vec![i])).await.unwrap();
        }

        let mut req = fetch_all("t", 2);
        req.positions.insert(1, 4);
        req.max_records = 4;
        let got = per_partition(&broker.fetch(req).await.unwrap());
        assert_eq!(got.get(&0), Some(&vec![0, 1, 2]));
        assert_eq!(got.get(&1), Some(&vec![4]));
    }

    #[tokio::test]
    async fn single_record_fetches_rotate_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 2).await.unwrap();
        for i in 0..4u8 {
            broker.produce(ProducerRecord::new("t", None, vec![i])).await.unwrap();
        }

        let mut req = fetch_all("t", 2);
        req.max_records = 1;
        let first = broker.fetch(req.clone()).await.unwrap();
        let second = broker.fetch(req).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].partition(), second[0].partition());
    }

    #[tokio::test]
    async fn commit_is_per_group() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1).await.unwrap();
        broker.commit("t", "g1", OffsetMarker::new(0, 3)).await.unwrap();

        assert_eq!(broker.committed_offset("t", "g1", 0).await, Some(3));
        assert_eq!(broker.committed_offset("t", "g2", 0).await, None);
        assert_eq!(broker.committed("t", "g1").await.unwrap().get(&0), Some(&3));
    }
}
