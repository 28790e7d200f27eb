//! Avro codec для topic-bridge: JSON ↔ Avro поверх Confluent wire format,
//! кэш схем с коалесцированием запросов, клиенты schema registry.

mod codec;
mod convert;
pub mod registry;
pub mod wire;

pub use codec::{LookupConfig, SchemaCodec, SchemaHandle};
pub use registry::{HttpSchemaRegistry, StaticSchemaRegistry};
