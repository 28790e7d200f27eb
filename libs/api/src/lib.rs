//! Общие типы и трейты коллабораторов topic-bridge.
//!
//! Crate не зависит от tokio: трейты возвращают boxed futures,
//! runtime выбирают реализации.

pub mod error;
pub mod topic;
pub mod types;
pub mod util;

pub use error::{BridgeError, ErrorKind};
pub use topic::{
    BoxFuture, BrokerConsumer, BrokerProducer, DeadLetterSink, FetchRequest, RecordObserver,
    SchemaRegistry,
};
pub use types::{
    Ack, DeliveryState, Headers, OffsetMarker, ProducerRecord, Record, RegisteredSchema,
    SchemaRef, SchemaVersion,
};
pub use util::{RetryPolicy, now_ms};
