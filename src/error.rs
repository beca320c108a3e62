use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalcGridError {
    #[error("Job {0} was cancelled")]
    JobCancelled(u64),

    #[error("Identifier {0} is not known to the identifier map")]
    UnknownIdentifier(u64),

    #[error("Job items carry unresolved identifiers; resolve them before execution")]
    UnresolvedIdentifiers,

    #[error("Connection to remote node host lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CalcGridError>;
