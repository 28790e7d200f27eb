use bridge_api::BridgeError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("pipeline [{pipeline}]: batch failed {attempts} times, giving up: {source}")]
    BatchExhausted { pipeline: String, attempts: u32, source: BridgeError },

    #[error("pipeline [{pipeline}]: {pauses} consecutive polls failed: {source}")]
    PollExhausted { pipeline: String, pauses: u32, source: BridgeError },
}
