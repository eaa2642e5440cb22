//! Removal of forbidden terms from recognised text.

use std::collections::HashSet;

use tracing::info;

use super::JoinProcessor;
use crate::error::ProcessingError;
use crate::types::{decode_boxes, encode_boxes, TextBoundingBox};

/// Drop every box whose whole text equals a forbidden term, ignoring case.
///
/// Order of the remaining boxes is preserved.
pub fn filter_pii(boxes: Vec<TextBoundingBox>, forbidden: &[String]) -> Vec<TextBoundingBox> {
    let forbidden: HashSet<String> = forbidden.iter().map(|t| t.to_lowercase()).collect();
    boxes
        .into_iter()
        .filter(|b| !forbidden.contains(&b.text.to_lowercase()))
        .collect()
}

/// Joins OCR output (primary) with the submitted term list (broadcast).
#[derive(Debug, Default, Clone, Copy)]
pub struct PiiFilterProcessor;

impl JoinProcessor for PiiFilterProcessor {
    fn name(&self) -> &'static str {
        "pii-filter"
    }

    fn process(&self, primary: &[u8], matched: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        let boxes = decode_boxes(primary)?;
        let terms: Vec<String> = serde_json::from_slice(matched)?;

        let before = boxes.len();
        let kept = filter_pii(boxes, &terms);
        info!(
            boxes = before,
            redacted = before - kept.len(),
            terms = terms.len(),
            "Filtered PII"
        );

        Ok(encode_boxes(&kept)?)
    }
}
