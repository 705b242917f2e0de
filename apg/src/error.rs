use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApgError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{count} non-finite log-weight(s) in {stage}")]
    NumericInstability { stage: String, count: usize },

    #[error("shape mismatch for `{name}`: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("oracle did not provide `{0}`")]
    MissingOutput(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ApgError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape_mismatch(name: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApgError>;
