use std::sync::Arc;

use bridge_api::{BoxFuture, BridgeError, DeadLetterSink, ProducerRecord, Record, now_ms};

use crate::producer::TopicProducer;

pub const HEADER_ERROR_KIND: &str = "dlq.error.kind";
pub const HEADER_ERROR_MESSAGE: &str = "dlq.error.message";
pub const HEADER_SOURCE_TOPIC: &str = "dlq.source.topic";
pub const HEADER_SOURCE_PARTITION: &str = "dlq.source.partition";
pub const HEADER_SOURCE_OFFSET: &str = "dlq.source.offset";
pub const HEADER_TIMESTAMP: &str = "dlq.timestamp.ms";

/// Dead-letter в topic: исходные payload и ключ + заголовки с причиной.
pub struct TopicDeadLetter {
    producer: Arc<TopicProducer>,
    topic: String,
}

impl TopicDeadLetter {
    pub fn new(producer: Arc<TopicProducer>, topic: impl Into<String>) -> Self {
        Self { producer, topic: topic.into() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn envelope(&self, record: &Record, error: &BridgeError) -> ProducerRecord {
        let mut out = ProducerRecord::new(&self.topic, record.key().map(str::to_string), record.payload().to_vec());
        out.headers = record.headers().clone();
        out.with_header(HEADER_ERROR_KIND, error.name())
            .with_header(HEADER_ERROR_MESSAGE, error.to_string())
            .with_header(HEADER_SOURCE_TOPIC, record.topic())
            .with_header(HEADER_SOURCE_PARTITION, record.partition().to_string())
            .with_header(HEADER_SOURCE_OFFSET, record.offset().to_string())
            .with_header(HEADER_TIMESTAMP, now_ms().to_string())
    }
}

impl DeadLetterSink for TopicDeadLetter {
    fn dead_letter<'a>(&'a self, record: &'a Record, error: &'a BridgeError)
        -> BoxFuture<'a, Result<(), BridgeError>>
    {
        Box::pin(async move {
            let ack = self.producer.send(self.envelope(record, error)).await?;
            tracing::warn!(
                source = %record.marker(),
                dlq = %self.topic,
                dlq_offset = ack.offset,
                kind = error.name(),
                error = %error,
                "record dead-lettered"
            );
            Ok(())
        })
    }
}
