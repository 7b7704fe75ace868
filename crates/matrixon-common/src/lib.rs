//! Common types shared by the Matrixon sliding sync crates

pub mod error;

pub use error::{ErrorPayload, MatrixonError, Result};
