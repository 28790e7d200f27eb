use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use bridge_api::{
    BridgeError, DeadLetterSink, DeliveryState, ErrorKind, OffsetMarker, ProducerRecord, Record,
    SchemaRef,
};
use codec_avro::{SchemaCodec, SchemaHandle};

use crate::PipelineError;
use crate::config::{BridgeConfig, PipelineConfig};
use crate::consumer::TopicConsumer;
use crate::producer::{OrderingKey, TopicProducer};

// ═══════════════════════════════════════════════════════════════
//  Options & Stats
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Имя в логах.
    pub name: String,
    pub destination_topic: String,
    /// Схема, в которую кодируются записи.
    pub schema: SchemaRef,
    pub max_batch: usize,
    pub pipeline: PipelineConfig,
}

impl BridgeOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            name: format!("{}->{}", config.source_topic, config.destination_topic),
            destination_topic: config.destination_topic.clone(),
            schema: config.destination_schema(),
            max_batch: config.consumer.max_batch,
            pipeline: config.pipeline.clone(),
        }
    }
}

/// Счётчики за время работы pipeline'а.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Прочитано записей (повторно прочитанные считаются снова).
    pub consumed: u64,
    /// Опубликовано в закоммиченных batch'ах.
    pub produced: u64,
    pub dead_lettered: u64,
    pub committed_batches: u64,
    pub batch_retries: u64,
    /// Паузы после неудачного poll.
    pub pauses: u64,
}

/// Результат одного успешного прохода batch'а (до commit'а).
struct BatchOutcome {
    produced: u64,
    dead_lettered: u64,
    /// partition → максимальный offset batch'а.
    commits: BTreeMap<i32, i64>,
}

pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Подождать `delay`; `false`, если за это время пришла отмена.
pub(crate) async fn pause(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = token.cancelled() => false,
    }
}

/// Максимальный offset каждой партиции среди записей.
pub(crate) fn batch_commits(records: &[Record]) -> BTreeMap<i32, i64> {
    let mut commits = BTreeMap::new();
    for record in records {
        let offset = commits.entry(record.partition()).or_insert(record.offset());
        *offset = (*offset).max(record.offset());
    }
    commits
}

/// Закоммитить маркеры batch'а. Уже закоммиченные партиции пропускаются,
/// чтобы повтор batch'а после частичного commit'а не упирался в регрессию.
pub(crate) async fn commit_batch(
    consumer: &mut TopicConsumer,
    commits: &BTreeMap<i32, i64>,
) -> Result<(), BridgeError> {
    for (&partition, &offset) in commits {
        if consumer.committed(partition).is_some_and(|c| c >= offset) {
            continue;
        }
        consumer.commit(OffsetMarker::new(partition, offset)).await?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  BridgePipeline
// ═══════════════════════════════════════════════════════════════

/// consume → JSON → Avro → produce → commit.
///
/// Offset партиции коммитится только после ack'ов (или записи в
/// dead-letter) всех записей batch'а. Ошибки уровня записи уходят в
/// dead-letter, `Retriable` ошибки повторяют batch целиком.
pub struct BridgePipeline {
    consumer: TopicConsumer,
    producer: Arc<TopicProducer>,
    codec: Arc<SchemaCodec>,
    dead_letter: Arc<dyn DeadLetterSink>,
    options: BridgeOptions,
    stats: PipelineStats,
}

impl BridgePipeline {
    pub fn new(
        consumer: TopicConsumer,
        producer: Arc<TopicProducer>,
        codec: Arc<SchemaCodec>,
        dead_letter: Arc<dyn DeadLetterSink>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            consumer,
            producer,
            codec,
            dead_letter,
            options,
            stats: PipelineStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Работать до отмены `token` или до эскалации ошибки.
    pub async fn run(&mut self, token: CancellationToken) -> Result<PipelineStats, PipelineError> {
        tracing::info!(
            pipeline = %self.options.name,
            source = %self.consumer.topic(),
            group = %self.consumer.group(),
            destination = %self.options.destination_topic,
            schema = %self.options.schema,
            "pipeline started"
        );
        let pause_policy = self.options.pipeline.pause_policy();
        let mut pauses = 0u32;

        loop {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                polled = self.consumer.poll(self.options.max_batch) => polled,
            };

            match polled {
                Ok(records) if records.is_empty() => pauses = 0,
                Ok(records) => {
                    pauses = 0;
                    self.stats.consumed += records.len() as u64;
                    if let Flow::Stop = self.handle_batch(records, &token).await? {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Retriable => {
                    pauses += 1;
                    self.stats.pauses += 1;
                    if pauses > self.options.pipeline.max_consecutive_pauses {
                        tracing::error!(pipeline = %self.options.name, pauses, error = %e, "poll keeps failing, stopping");
                        return Err(PipelineError::PollExhausted {
                            pipeline: self.options.name.clone(),
                            pauses,
                            source: e,
                        });
                    }
                    let delay = pause_policy.backoff(pauses - 1);
                    tracing::warn!(pipeline = %self.options.name, pauses, ?delay, error = %e, "poll failed, pausing");
                    if !pause(delay, &token).await {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(pipeline = %self.options.name, stats = ?self.stats, "pipeline stopped");
        Ok(self.stats)
    }

    /// Провести batch до commit'а, повторяя его целиком при `Retriable` ошибках.
    async fn handle_batch(&mut self, records: Vec<Record>, token: &CancellationToken) -> Result<Flow, PipelineError> {
        let pause_policy = self.options.pipeline.pause_policy();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let Some(result) = self.attempt_batch(&records, token).await else {
                tracing::warn!(
                    pipeline = %self.options.name,
                    grace = ?self.options.pipeline.shutdown_grace(),
                    "in-flight sends abandoned, batch not committed"
                );
                self.consumer.rewind();
                return Ok(Flow::Stop);
            };

            let error = match result {
                Ok(outcome) => match commit_batch(&mut self.consumer, &outcome.commits).await {
                    Ok(()) => {
                        self.stats.produced += outcome.produced;
                        self.stats.dead_lettered += outcome.dead_lettered;
                        self.stats.committed_batches += 1;
                        tracing::debug!(
                            pipeline = %self.options.name,
                            records = records.len(),
                            produced = outcome.produced,
                            dead_lettered = outcome.dead_lettered,
                            commits = ?outcome.commits,
                            "batch committed"
                        );
                        return Ok(Flow::Continue);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if error.kind() != ErrorKind::Retriable {
                self.consumer.rewind();
                return Err(error.into());
            }
            if attempt >= self.options.pipeline.batch_attempts.max(1) {
                tracing::error!(pipeline = %self.options.name, attempts = attempt, error = %error, "batch keeps failing, stopping");
                self.consumer.rewind();
                return Err(PipelineError::BatchExhausted {
                    pipeline: self.options.name.clone(),
                    attempts: attempt,
                    source: error,
                });
            }

            self.stats.batch_retries += 1;
            let delay = pause_policy.backoff(attempt - 1);
            tracing::warn!(pipeline = %self.options.name, attempt, ?delay, error = %error, "batch failed, retrying");
            if !pause(delay, token).await {
                self.consumer.rewind();
                return Ok(Flow::Stop);
            }
        }
    }

    /// Один проход batch'а. После отмены даёт in-flight send'ам
    /// `shutdown_grace`; `None` — не успели.
    async fn attempt_batch(
        &self,
        records: &[Record],
        token: &CancellationToken,
    ) -> Option<Result<BatchOutcome, BridgeError>> {
        let work = self.process_batch(records);
        tokio::pin!(work);
        tokio::select! {
            result = &mut work => Some(result),
            _ = token.cancelled() => {
                tracing::info!(pipeline = %self.options.name, "cancel requested, draining in-flight sends");
                tokio::time::timeout(self.options.pipeline.shutdown_grace(), &mut work).await.ok()
            }
        }
    }

    async fn process_batch(&self, records: &[Record]) -> Result<BatchOutcome, BridgeError> {
        let handle = self.codec.resolve(&self.options.schema).await?;
        let mut states = vec![DeliveryState::Consumed; records.len()];
        let mut rejected: Vec<(usize, BridgeError)> = Vec::new();
        let mut outgoing = Vec::with_capacity(records.len());

        for (idx, record) in records.iter().enumerate() {
            match self.convert(record, &handle, &mut states[idx]) {
                Ok(payload) => outgoing.push((
                    idx,
                    ProducerRecord::new(&self.options.destination_topic, record.key().map(str::to_string), payload),
                )),
                Err(e) if e.kind() == ErrorKind::Record => rejected.push((idx, e)),
                Err(e) => return Err(e),
            }
        }

        // одна lane на ключ, записи без ключа — по партиции источника
        let sends = outgoing.into_iter().map(|(idx, out)| {
            let ordering = OrderingKey::for_source(records[idx].key(), records[idx].partition());
            async move { (idx, self.producer.send_ordered(ordering, out).await) }
        });
        let mut failure = None;
        let mut produced = 0;
        for (idx, result) in join_all(sends).await {
            match result {
                Ok(_) => {
                    states[idx] = DeliveryState::Produced;
                    produced += 1;
                }
                Err(e) if e.kind() == ErrorKind::Record => rejected.push((idx, e)),
                Err(e) => {
                    tracing::warn!(pipeline = %self.options.name, source = %records[idx].marker(), error = %e, "send failed");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        rejected.sort_by_key(|(idx, _)| *idx);
        for (idx, error) in &rejected {
            let record = &records[*idx];
            tracing::warn!(
                pipeline = %self.options.name,
                source = %record.marker(),
                stage = ?states[*idx],
                error = %error,
                "rejecting record"
            );
            self.dead_letter.dead_letter(record, error).await?;
        }

        Ok(BatchOutcome {
            produced,
            dead_lettered: rejected.len() as u64,
            commits: batch_commits(records),
        })
    }

    fn convert(
        &self,
        record: &Record,
        handle: &SchemaHandle,
        state: &mut DeliveryState,
    ) -> Result<Vec<u8>, BridgeError> {
        let value = self.codec.decode_json(record.payload(), handle)?;
        *state = DeliveryState::Decoded;
        let payload = self.codec.encode_avro(&value, handle)?;
        *state = DeliveryState::Encoded;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use bridge_api::Headers;

    use super::*;

    fn rec(partition: i32, offset: i64) -> Record {
        Record::new("t", OffsetMarker::new(partition, offset), None, Vec::new(), Headers::new())
    }

    #[test]
    fn commits_take_max_offset_per_partition() {
        let records = [rec(0, 4), rec(1, 9), rec(0, 6), rec(0, 5)];
        assert_eq!(batch_commits(&records), BTreeMap::from([(0, 6), (1, 9)]));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_cut_short_by_cancel() {
        let token = CancellationToken::new();
        assert!(pause(Duration::from_millis(5), &token).await);
        token.cancel();
        assert!(!pause(Duration::from_secs(3600), &token).await);
    }
}
