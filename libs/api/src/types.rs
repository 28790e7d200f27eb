use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Строковые заголовки записи.
pub type Headers = BTreeMap<String, String>;

// ════════════════════════════════════════════════════════════════
//  Offsets
// ════════════════════════════════════════════════════════════════

/// Позиция записи внутри партиции.
///
/// При commit маркер указывает на **последнюю полностью обработанную**
/// запись (inclusive); чтение продолжается с `offset + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffsetMarker {
    pub partition: i32,
    pub offset: i64,
}

impl OffsetMarker {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for OffsetMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Подтверждение брокера: партиция и offset, назначенные записи.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

// ════════════════════════════════════════════════════════════════
//  Records
// ════════════════════════════════════════════════════════════════

/// Запись, прочитанная из topic'а. Неизменяема после чтения.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    topic: String,
    marker: OffsetMarker,
    key: Option<String>,
    payload: Vec<u8>,
    headers: Headers,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        marker: OffsetMarker,
        key: Option<String>,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Self {
        Self {
            topic: topic.into(),
            marker,
            key,
            payload,
            headers,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn marker(&self) -> OffsetMarker {
        self.marker
    }

    pub fn partition(&self) -> i32 {
        self.marker.partition
    }

    pub fn offset(&self) -> i64 {
        self.marker.offset
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Исходящая запись: offset назначит брокер при ack.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Прогресс одной записи через pipeline. Живёт только в памяти.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryState {
    Consumed,
    Decoded,
    Encoded,
    Produced,
    Committed,
}

// ════════════════════════════════════════════════════════════════
//  Schemas
// ════════════════════════════════════════════════════════════════

/// Версия схемы внутри subject'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchemaVersion {
    #[default]
    Latest,
    Number(u32),
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaVersion::Latest => f.write_str("latest"),
            SchemaVersion::Number(n) => write!(f, "{n}"),
        }
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(SchemaVersion::Latest);
        }
        s.parse::<u32>()
            .map(SchemaVersion::Number)
            .map_err(|_| format!("invalid schema version '{s}', expected 'latest' or a number"))
    }
}

/// Адрес схемы в registry: числовой id или subject + version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaRef {
    Id(u32),
    Subject { name: String, version: SchemaVersion },
}

impl SchemaRef {
    pub fn subject(name: impl Into<String>, version: SchemaVersion) -> Self {
        Self::Subject { name: name.into(), version }
    }
}

impl std::fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaRef::Id(id) => write!(f, "id:{id}"),
            SchemaRef::Subject { name, version } => write!(f, "{name}/{version}"),
        }
    }
}

/// Ответ registry: id и текстовое определение схемы.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    pub id: u32,
    pub subject: Option<String>,
    pub version: Option<u32>,
    pub definition: String,
}
