#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Bridge(#[from] bridge_api::BridgeError),

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("topic: {0}")]
    Topic(#[from] topic_engine::TopicError),

    #[error("task: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
