#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("topic '{0}' not found")]
    NotFound(String),

    #[error("topic '{0}' already exists")]
    AlreadyExists(String),

    #[error("topic '{topic}': partition count must be positive, got {partitions}")]
    InvalidPartitions { topic: String, partitions: i32 },

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
}

impl TopicError {
    /// Convert to BridgeError for the produce path.
    ///
    /// Записать в несуществующий topic или слишком большое сообщение
    /// повтором не исправить → `Delivery`.
    pub fn into_delivery_error(self) -> bridge_api::BridgeError {
        bridge_api::BridgeError::delivery(self.to_string())
    }

    /// Convert to BridgeError for the fetch / metadata path.
    ///
    /// Topic может появиться позже (создание, выборы лидера) → `BrokerUnavailable`.
    pub fn into_fetch_error(self) -> bridge_api::BridgeError {
        match self {
            TopicError::NotFound(_) => bridge_api::BridgeError::BrokerUnavailable(self.to_string()),
            other => bridge_api::BridgeError::config(other.to_string()),
        }
    }
}
