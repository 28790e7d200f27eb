use std::collections::BTreeMap;
use std::sync::Arc;

use bridge_api::{BridgeError, BrokerConsumer, FetchRequest, OffsetMarker, Record, RetryPolicy};

use crate::config::ConsumerConfig;
use crate::retry::{RetryError, with_retry};

/// Состояние consumer'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    /// Записи выданы, ждут commit'а.
    Delivering,
    Committing,
}

/// At-least-once чтение topic'а группой.
///
/// Держит три позиции на партицию:
/// - `committed` — последний закоммиченный offset (inclusive);
/// - `positions` — следующий offset для fetch;
/// - `delivered` — последний offset, отданный через `poll`.
///
/// Commit разрешён только в `(committed, delivered]`.
pub struct TopicConsumer {
    broker: Arc<dyn BrokerConsumer>,
    topic: String,
    group: String,
    max_batch: usize,
    poll_timeout: std::time::Duration,
    retry: RetryPolicy,
    state: ConsumerState,
    committed: BTreeMap<i32, i64>,
    positions: BTreeMap<i32, i64>,
    delivered: BTreeMap<i32, i64>,
}

fn unavailable(operation: &str, error: RetryError) -> BridgeError {
    match error {
        RetryError::Permanent(e) => e,
        RetryError::Exhausted { last, attempts } => {
            BridgeError::BrokerUnavailable(format!("{operation} failed after {attempts} attempts: {last}"))
        }
    }
}

impl TopicConsumer {
    /// Подписаться: прочитать committed offsets группы. Партиции без
    /// commit'а читаются с самого начала (`auto.offset.reset=earliest`).
    pub async fn subscribe(
        broker: Arc<dyn BrokerConsumer>,
        topic: impl Into<String>,
        group: impl Into<String>,
        config: &ConsumerConfig,
    ) -> Result<Self, BridgeError> {
        let topic = topic.into();
        let group = group.into();

        let partitions = with_retry(&config.retry, "partitions", || broker.partitions(&topic))
            .await
            .map_err(|e| unavailable("partitions", e))?;
        let committed = with_retry(&config.retry, "committed", || broker.committed(&topic, &group))
            .await
            .map_err(|e| unavailable("committed", e))?;

        let mut consumer = Self {
            broker,
            topic,
            group,
            max_batch: config.max_batch.max(1),
            poll_timeout: config.poll_timeout(),
            retry: config.retry,
            state: ConsumerState::Idle,
            committed: committed.into_iter().filter(|(p, _)| (0..partitions).contains(p)).collect(),
            positions: BTreeMap::new(),
            delivered: BTreeMap::new(),
        };
        consumer.reset_positions(partitions);
        tracing::info!(
            topic = %consumer.topic,
            group = %consumer.group,
            partitions,
            committed = ?consumer.committed,
            "subscribed"
        );
        Ok(consumer)
    }

    fn reset_positions(&mut self, partitions: i32) {
        self.positions = (0..partitions)
            .map(|p| (p, self.committed.get(&p).map_or(0, |c| c + 1)))
            .collect();
        self.delivered = self.committed.clone();
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Последний закоммиченный offset партиции.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).copied()
    }

    /// Следующий offset для чтения.
    pub fn position(&self, partition: i32) -> Option<i64> {
        self.positions.get(&partition).copied()
    }

    /// Дождаться записей (не дольше `poll_timeout`), до `max_batch` штук.
    ///
    /// Пустой результат = таймаут. Недоступность брокера ретраится;
    /// после потолка попыток → `BrokerUnavailable`.
    pub async fn poll(&mut self, max_batch: usize) -> Result<Vec<Record>, BridgeError> {
        self.state = ConsumerState::Polling;
        let request = FetchRequest {
            topic: self.topic.clone(),
            positions: self.positions.clone(),
            max_records: max_batch.clamp(1, self.max_batch),
            max_wait: self.poll_timeout,
        };

        let broker = &self.broker;
        let result = with_retry(&self.retry, "fetch", || broker.fetch(request.clone())).await;
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                self.state = ConsumerState::Idle;
                return Err(unavailable("fetch", e));
            }
        };

        for record in &records {
            let next = record.offset() + 1;
            let position = self.positions.entry(record.partition()).or_insert(next);
            *position = (*position).max(next);
            let delivered = self.delivered.entry(record.partition()).or_insert(record.offset());
            *delivered = (*delivered).max(record.offset());
        }
        self.state = if records.is_empty() { ConsumerState::Idle } else { ConsumerState::Delivering };
        tracing::debug!(topic = %self.topic, group = %self.group, count = records.len(), "polled");
        Ok(records)
    }

    /// Зафиксировать маркер (последний обработанный offset, inclusive).
    ///
    /// Маркер обязан продвигать committed offset и не выходить за
    /// выданное через `poll`.
    pub async fn commit(&mut self, marker: OffsetMarker) -> Result<(), BridgeError> {
        if let Some(&committed) = self.committed.get(&marker.partition) {
            if marker.offset <= committed {
                return Err(BridgeError::OffsetRegression {
                    partition: marker.partition,
                    committed,
                    requested: marker.offset,
                });
            }
        }
        let delivered = self.delivered.get(&marker.partition).copied();
        if delivered.is_none_or(|d| marker.offset > d) {
            return Err(BridgeError::UndeliveredOffset {
                partition: marker.partition,
                delivered,
                requested: marker.offset,
            });
        }

        self.state = ConsumerState::Committing;
        let broker = &self.broker;
        let (topic, group) = (&self.topic, &self.group);
        let result = with_retry(&self.retry, "commit", || broker.commit(topic, group, marker)).await;
        self.state = ConsumerState::Idle;
        result.map_err(|e| unavailable("commit", e))?;

        self.committed.insert(marker.partition, marker.offset);
        tracing::debug!(topic = %self.topic, group = %self.group, %marker, "committed");
        Ok(())
    }

    /// Вернуться к committed offsets: всё незакоммиченное будет прочитано снова.
    pub fn rewind(&mut self) {
        let partitions = self.positions.len() as i32;
        self.reset_positions(partitions);
        self.state = ConsumerState::Idle;
        tracing::info!(topic = %self.topic, group = %self.group, positions = ?self.positions, "rewound to committed offsets");
    }
}
