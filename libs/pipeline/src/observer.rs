use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use bridge_api::{BridgeError, ErrorKind, Record, RecordObserver};
use codec_avro::SchemaCodec;

use crate::PipelineError;
use crate::bridge::{Flow, batch_commits, commit_batch, pause};
use crate::config::{BridgeConfig, PipelineConfig};
use crate::consumer::TopicConsumer;

// ═══════════════════════════════════════════════════════════════
//  Observers
// ═══════════════════════════════════════════════════════════════

/// Пишет каждую декодированную запись в лог на уровне info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RecordObserver for LogObserver {
    fn observe(&self, record: &Record, value: &serde_json::Value) {
        tracing::info!(
            topic = %record.topic(),
            source = %record.marker(),
            body = %value,
            "avro message received"
        );
    }
}

// ═══════════════════════════════════════════════════════════════
//  ObserverSink
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ObserverOptions {
    pub name: String,
    pub max_batch: usize,
    pub pipeline: PipelineConfig,
}

impl ObserverOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            name: format!("observer:{}", config.destination_topic),
            max_batch: config.observer.max_batch,
            pipeline: config.pipeline.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub observed: u64,
    pub rejected: u64,
    pub committed_batches: u64,
}

/// Независимый consumer topic'а назначения: framed Avro → JSON → observer.
///
/// Ошибка декодирования записи не останавливает цикл: `reject` + warning.
/// Недоступный registry повторяет batch, как в BridgePipeline;
/// неизвестный id схемы — ошибка записи.
pub struct ObserverSink {
    consumer: TopicConsumer,
    codec: Arc<SchemaCodec>,
    observer: Arc<dyn RecordObserver>,
    options: ObserverOptions,
    stats: ObserverStats,
}

impl ObserverSink {
    pub fn new(
        consumer: TopicConsumer,
        codec: Arc<SchemaCodec>,
        observer: Arc<dyn RecordObserver>,
        options: ObserverOptions,
    ) -> Self {
        Self {
            consumer,
            codec,
            observer,
            options,
            stats: ObserverStats::default(),
        }
    }

    pub fn stats(&self) -> ObserverStats {
        self.stats
    }

    pub async fn run(&mut self, token: CancellationToken) -> Result<ObserverStats, PipelineError> {
        tracing::info!(
            pipeline = %self.options.name,
            topic = %self.consumer.topic(),
            group = %self.consumer.group(),
            "observer started"
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
                    if let Flow::Stop = self.handle_batch(&records, &token).await? {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Retriable => {
                    pauses += 1;
                    if pauses > self.options.pipeline.max_consecutive_pauses {
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

        tracing::info!(pipeline = %self.options.name, stats = ?self.stats, "observer stopped");
        Ok(self.stats)
    }

    async fn handle_batch(&mut self, records: &[Record], token: &CancellationToken) -> Result<Flow, PipelineError> {
        let pause_policy = self.options.pipeline.pause_policy();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match self.observe_batch(records).await {
                Ok((observed, rejected)) => match commit_batch(&mut self.consumer, &batch_commits(records)).await {
                    Ok(()) => {
                        self.stats.observed += observed;
                        self.stats.rejected += rejected;
                        self.stats.committed_batches += 1;
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
                self.consumer.rewind();
                return Err(PipelineError::BatchExhausted {
                    pipeline: self.options.name.clone(),
                    attempts: attempt,
                    source: error,
                });
            }
            let delay = pause_policy.backoff(attempt - 1);
            tracing::warn!(pipeline = %self.options.name, attempt, ?delay, error = %error, "batch failed, retrying");
            if !pause(delay, token).await {
                self.consumer.rewind();
                return Ok(Flow::Stop);
            }
        }
    }

    /// Декодировать и отдать observer'у. Все схемы batch'а резолвятся до
    /// первого `observe`: недоступная схема не даёт показать запись дважды.
    async fn observe_batch(&self, records: &[Record]) -> Result<(u64, u64), BridgeError> {
        let mut decoded = Vec::with_capacity(records.len());
        for record in records {
            match self.codec.decode_framed(record.payload()).await {
                Ok(value) => decoded.push(Ok(value)),
                Err(e) if e.kind() == ErrorKind::Record => decoded.push(Err(e)),
                Err(e) => return Err(e),
            }
        }

        let (mut observed, mut rejected) = (0, 0);
        for (record, result) in records.iter().zip(decoded) {
            match result {
                Ok(value) => {
                    self.observer.observe(record, &value);
                    observed += 1;
                }
                Err(error) => {
                    tracing::warn!(pipeline = %self.options.name, source = %record.marker(), error = %error, "cannot decode record");
                    self.observer.reject(record, &error);
                    rejected += 1;
                }
            }
        }
        Ok((observed, rejected))
    }
}
