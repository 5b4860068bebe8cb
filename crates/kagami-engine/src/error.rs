use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] kagami_core::KagamiError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("image download failed: {0}")]
    Image(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("{0} collection is absent")]
    MissingCollection(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
