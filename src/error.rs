use thiserror::Error;

/// Failure taxonomy shared by the producer, the consumer loops and the store.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Data store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Data store error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        PipelineError::NotFound { entity, id }
    }

    /// Whether retrying the same message later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStore(_) | PipelineError::Connection(_)
        )
    }
}
