use graph_flow::GraphError;
use thiserror::Error;

/// Failures at the document storage boundary
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document {id} was modified concurrently (expected version {expected})")]
    VersionConflict { id: String, expected: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt document record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Which external text-generation call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Summary,
    Verification,
    Correction,
}

impl std::fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GenerationStage::Summary => "summary generation",
            GenerationStage::Verification => "verification",
            GenerationStage::Correction => "correction",
        };
        f.write_str(name)
    }
}

/// Errors that abort a verification run
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Text generation failed during {stage} (attempt {attempt}): {message}")]
    Generation {
        stage: GenerationStage,
        attempt: u32,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Workflow error: {0}")]
    Workflow(String),
}

impl VerificationError {
    pub fn generation(stage: GenerationStage, attempt: u32, source: anyhow::Error) -> Self {
        VerificationError::Generation {
            stage,
            attempt,
            message: format!("{:#}", source),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerificationError>;

impl From<VerificationError> for GraphError {
    fn from(err: VerificationError) -> Self {
        GraphError::Other(err.into())
    }
}

impl From<GraphError> for VerificationError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Other(err) => err
                .downcast::<VerificationError>()
                .unwrap_or_else(|other| VerificationError::Workflow(format!("{:#}", other))),
            other => VerificationError::Workflow(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}
