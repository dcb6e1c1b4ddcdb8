use thiserror::Error;

use crate::types::TensorShape;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unknown layer kind: {0}")]
    UnknownLayer(String),
    #[error("Shape error in {context}: expected {expected}, found {found}")]
    Shape {
        context: &'static str,
        expected: TensorShape,
        found: TensorShape,
    },
    #[error("Shape error: {0}")]
    ShapeMsg(String),
    #[error("Wiring error: {0}")]
    Wiring(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad magic in stream: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u64, found: u64 },
    #[error("Numeric error: {nan_count} NaN and {inf_count} Inf values detected in {context}")]
    Numeric {
        context: String,
        nan_count: usize,
        inf_count: usize,
    },
    #[error("Invalid state: {0}")]
    State(String),
    #[error("Gradient check failed: {0}")]
    GradientCheck(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NetError {
    pub fn shape(context: &'static str, expected: TensorShape, found: TensorShape) -> Self {
        NetError::Shape {
            context,
            expected,
            found,
        }
    }

    /// True for the validation kinds that abort graph construction.
    pub fn is_fatal_at_load(&self) -> bool {
        matches!(
            self,
            NetError::Config(_)
                | NetError::UnknownLayer(_)
                | NetError::Shape { .. }
                | NetError::ShapeMsg(_)
                | NetError::Wiring(_)
        )
    }
}

pub type NetResult<T> = Result<T, NetError>;
