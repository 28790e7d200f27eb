/// Category of a bridge error. Allows the pipeline to make intelligent
/// decisions about error handling (dead-letter, pause and retry, fail fast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration — permanent, fail at startup.
    Config,
    /// Bad record — isolate via dead-letter, continue with the next one.
    Record,
    /// Connectivity / availability — pause, retry the batch.
    Retriable,
    /// Logical error (invalid state, cancellation).
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Record => f.write_str("record"),
            ErrorKind::Retriable => f.write_str("retriable"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Unified error type for codec, broker and registry collaborators.
///
/// Each variant maps to one `ErrorKind`; the pipeline never inspects
/// messages, only kinds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("schema mismatch at '{path}': {message}")]
    SchemaMismatch { path: String, message: String },

    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),

    /// Registry ответил, что такой схемы нет. Для id из заголовка
    /// записи это ошибка самой записи.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("transient send failure: {0}")]
    TransientSend(String),

    /// `retries_exhausted = true` — ретраи `TransientSend` исчерпаны,
    /// запись сама по себе корректна.
    #[error("delivery failed: {message}")]
    Delivery { message: String, retries_exhausted: bool },

    #[error("offset regression on partition {partition}: committed {committed}, requested {requested}")]
    OffsetRegression { partition: i32, committed: i64, requested: i64 },

    #[error("offset {requested} on partition {partition} was never delivered (delivered up to {delivered:?})")]
    UndeliveredOffset { partition: i32, delivered: Option<i64>, requested: i64 },

    #[error("cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn mismatch(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaMismatch { path: path.into(), message: msg.into() }
    }

    /// Non-retriable delivery failure (message too large, rejected, ...).
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery { message: msg.into(), retries_exhausted: false }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Configuration(_) => ErrorKind::Config,
            BridgeError::MalformedInput(_)
            | BridgeError::SchemaMismatch { .. }
            | BridgeError::SchemaNotFound(_) => ErrorKind::Record,
            BridgeError::Delivery { retries_exhausted: false, .. } => ErrorKind::Record,
            BridgeError::Delivery { retries_exhausted: true, .. }
            | BridgeError::SchemaUnavailable(_)
            | BridgeError::BrokerUnavailable(_)
            | BridgeError::TransientSend(_) => ErrorKind::Retriable,
            BridgeError::OffsetRegression { .. }
            | BridgeError::UndeliveredOffset { .. }
            | BridgeError::Cancelled => ErrorKind::Logic,
        }
    }

    /// Короткое имя варианта — для заголовков dead-letter и логов.
    pub fn name(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::MalformedInput(_) => "malformed_input",
            BridgeError::SchemaMismatch { .. } => "schema_mismatch",
            BridgeError::SchemaUnavailable(_) => "schema_unavailable",
            BridgeError::SchemaNotFound(_) => "schema_not_found",
            BridgeError::BrokerUnavailable(_) => "broker_unavailable",
            BridgeError::TransientSend(_) => "transient_send",
            BridgeError::Delivery { .. } => "delivery",
            BridgeError::OffsetRegression { .. } => "offset_regression",
            BridgeError::UndeliveredOffset { .. } => "undelivered_offset",
            BridgeError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

impl From<std::str::Utf8Error> for BridgeError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_delivery_is_retriable() {
        let plain = BridgeError::delivery("message too large");
        let exhausted = BridgeError::Delivery {
            message: "3 attempts".into(),
            retries_exhausted: true,
        };
        assert_eq!(plain.kind(), ErrorKind::Record);
        assert_eq!(exhausted.kind(), ErrorKind::Retriable);
    }

    #[test]
    fn json_errors_are_malformed_input() {
        let err: BridgeError = serde_json::from_slice::<serde_json::Value>(br#"{"id":}"#)
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Record);
        assert_eq!(err.name(), "malformed_input");
    }

    #[test]
    fn missing_schema_is_a_record_error() {
        let err = BridgeError::SchemaNotFound("id 99".into());
        assert_eq!(err.kind(), ErrorKind::Record);
        assert_eq!(err.name(), "schema_not_found");
        assert_eq!(BridgeError::SchemaUnavailable("503".into()).kind(), ErrorKind::Retriable);
    }
}
