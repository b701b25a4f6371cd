use stcore::SpatialError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StDataError {
    #[error(transparent)]
    Spatial(#[from] SpatialError),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("no {kind} named '{name}' in the store")]
    NotFound { kind: String, name: String },
}

impl StDataError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        StDataError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StDataError>;
