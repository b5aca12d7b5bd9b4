use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Two tensors that must agree on a dimension do not.
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<i64>,
        right: Vec<i64>,
    },

    #[error("{op} expects a rank-{expected} tensor, got {shape:?}")]
    Rank {
        op: &'static str,
        expected: usize,
        shape: Vec<i64>,
    },

    /// A tensor's dtype or device differs from the model parameters.
    #[error("{op}: expected {expected:?} tensors, got {actual:?}")]
    Options {
        op: &'static str,
        expected: (tch::Kind, tch::Device),
        actual: (tch::Kind, tch::Device),
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
