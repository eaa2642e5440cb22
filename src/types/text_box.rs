//! Text bounding boxes produced by OCR and consumed by the PII filter.

use serde::{Deserialize, Serialize};

/// A recognised word and its pixel bounds.
///
/// Coordinates start at (0, 0) in the top-left corner of the image. The
/// derived ordering compares `text`, then `left`, `right`, `top`, `bottom`;
/// the pipeline never relies on it, it only exists so tests can compare
/// box lists deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextBoundingBox {
    pub text: String,
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

impl TextBoundingBox {
    pub fn new(text: impl Into<String>, left: i32, right: i32, top: i32, bottom: i32) -> Self {
        Self {
            text: text.into(),
            left,
            right,
            top,
            bottom,
        }
    }

    /// Build a box from an origin and extent, as OCR engines report them.
    pub fn from_extent(text: impl Into<String>, left: i32, top: i32, width: i32, height: i32) -> Self {
        Self::new(text, left, left + width, top, top + height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Decode a JSON array of box records.
pub fn decode_boxes(payload: &[u8]) -> serde_json::Result<Vec<TextBoundingBox>> {
    serde_json::from_slice(payload)
}

/// Encode boxes as a JSON array of `{text, left, right, top, bottom}` records.
pub fn encode_boxes(boxes: &[TextBoundingBox]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_extent() {
        let b = TextBoundingBox::from_extent("word", 10, 20, 30, 5);
        assert_eq!(b, TextBoundingBox::new("word", 10, 40, 20, 25));
        assert_eq!(b.width(), 30);
        assert_eq!(b.height(), 5);
    }

    #[test]
    fn test_wire_shape() {
        let boxes = vec![TextBoundingBox::new("", 1, 2, 3, 4)];
        let value: serde_json::Value = serde_json::from_slice(&encode_boxes(&boxes).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"text": "", "left": 1, "right": 2, "top": 3, "bottom": 4}])
        );
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(decode_boxes(br#"[{"text": "a", "left": 1}]"#).is_err());
        assert!(decode_boxes(b"not json").is_err());
    }

    #[test]
    fn test_ordering_is_text_first() {
        let mut boxes = vec![
            TextBoundingBox::new("b", 0, 1, 0, 1),
            TextBoundingBox::new("a", 5, 6, 0, 1),
            TextBoundingBox::new("a", 1, 2, 0, 1),
        ];
        boxes.sort();
        let texts: Vec<_> = boxes.iter().map(|b| (b.text.as_str(), b.left)).collect();
        assert_eq!(texts, vec![("a", 1), ("a", 5), ("b", 0)]);
    }
}
