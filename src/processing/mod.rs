//! Processing functions plugged into the pipeline stages.
//!
//! Implementations must be deterministic for the same input bytes: a
//! redelivered message invokes them again.

pub mod ocr;
pub mod pii;

use crate::error::ProcessingError;

pub use ocr::{parse_tsv, OcrProcessor, TesseractDetector, TextDetector};
pub use pii::{filter_pii, PiiFilterProcessor};

/// Single-input transformation used by the reliable stage.
pub trait Processor: Send + Sync + 'static {
    /// Get the name of this processor.
    fn name(&self) -> &'static str;

    /// Transform one payload into the payload to publish.
    fn process(&self, payload: &[u8]) -> Result<Vec<u8>, ProcessingError>;
}

/// Two-input transformation used by the correlating stage.
pub trait JoinProcessor: Send + Sync + 'static {
    /// Get the name of this processor.
    fn name(&self) -> &'static str;

    /// Combine a primary payload with the broadcast payload joined to it.
    fn process(&self, primary: &[u8], matched: &[u8]) -> Result<Vec<u8>, ProcessingError>;
}
