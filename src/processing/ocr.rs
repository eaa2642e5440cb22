//! Text detection through an external OCR engine.

use std::io::Write;
use std::process::Command;
use std::time::Instant;

use tracing::{debug, info};

use super::Processor;
use crate::error::ProcessingError;
use crate::types::{encode_boxes, OcrSettings, TextBoundingBox};

/// Extracts word boxes from an encoded image.
pub trait TextDetector: Send + Sync + 'static {
    fn detect_text(&self, image: &[u8]) -> Result<Vec<TextBoundingBox>, ProcessingError>;
}

/// Tesseract OCR, driven through its command-line interface.
#[derive(Debug, Clone)]
pub struct TesseractDetector {
    binary: String,
    language: String,
}

impl TesseractDetector {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }

    pub fn from_settings(settings: &OcrSettings) -> Self {
        Self::new(&settings.tesseract_binary, &settings.language)
    }
}

impl Default for TesseractDetector {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

impl TextDetector for TesseractDetector {
    fn detect_text(&self, image: &[u8]) -> Result<Vec<TextBoundingBox>, ProcessingError> {
        let start = Instant::now();

        // Tesseract reads from a path; the file is removed on drop.
        let mut input = tempfile::NamedTempFile::new()?;
        input.write_all(image)?;
        input.flush()?;

        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessingError::Ocr(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        let boxes = parse_tsv(&String::from_utf8_lossy(&output.stdout))?;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            boxes = boxes.len(),
            "Tesseract finished"
        );

        Ok(boxes)
    }
}

/// Parse Tesseract TSV output into word boxes.
///
/// Columns: level, page_num, block_num, par_num, line_num, word_num, left,
/// top, width, height, conf, text. Only word rows (`word_num > 0`) with
/// non-blank text are kept.
pub fn parse_tsv(tsv: &str) -> Result<Vec<TextBoundingBox>, ProcessingError> {
    let mut boxes = Vec::new();

    // Skip the header
    for (line_no, line) in tsv.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 11 {
            return Err(ProcessingError::Ocr(format!(
                "TSV line {} has {} columns, expected at least 11",
                line_no + 1,
                cols.len()
            )));
        }

        let field = |idx: usize| -> Result<i32, ProcessingError> {
            cols[idx].trim().parse().map_err(|_| {
                ProcessingError::Ocr(format!(
                    "TSV line {} column {} is not an integer: {:?}",
                    line_no + 1,
                    idx + 1,
                    cols[idx]
                ))
            })
        };

        if field(5)? <= 0 {
            continue;
        }

        let text = cols.get(11).copied().unwrap_or("");
        if text.trim().is_empty() {
            continue;
        }

        boxes.push(TextBoundingBox::from_extent(
            text,
            field(6)?,
            field(7)?,
            field(8)?,
            field(9)?,
        ));
    }

    Ok(boxes)
}

/// Replaces an image payload with the JSON array of its word boxes.
pub struct OcrProcessor<D: TextDetector> {
    detector: D,
}

impl<D: TextDetector> OcrProcessor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }
}

impl<D: TextDetector> Processor for OcrProcessor<D> {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn process(&self, payload: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        let boxes = self.detector.detect_text(payload)?;
        info!(image_bytes = payload.len(), boxes = boxes.len(), "Recognised text");
        Ok(encode_boxes(&boxes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decode_boxes;
    use pretty_assertions::assert_eq;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t640\t80\t-1\t
2\t1\t1\t0\t0\t0\t12\t10\t600\t30\t-1\t
4\t1\t1\t1\t1\t0\t12\t10\t600\t30\t-1\t
5\t1\t1\t1\t1\t1\t12\t10\t90\t28\t96.4\tMimica
5\t1\t1\t1\t1\t2\t110\t12\t120\t26\t95.1\tautomates
5\t1\t1\t1\t1\t3\t240\t12\t10\t26\t10.0\t
";

    struct FixedDetector(Vec<TextBoundingBox>);

    impl TextDetector for FixedDetector {
        fn detect_text(&self, _image: &[u8]) -> Result<Vec<TextBoundingBox>, ProcessingError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_tsv_keeps_words_only() {
        let boxes = parse_tsv(SAMPLE_TSV).unwrap();
        assert_eq!(
            boxes,
            vec![
                TextBoundingBox::new("Mimica", 12, 102, 10, 38),
                TextBoundingBox::new("automates", 110, 230, 12, 38),
            ]
        );
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        assert!(parse_tsv("").unwrap().is_empty());
        assert!(parse_tsv("level\tpage_num\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_tsv_rejects_garbage() {
        let tsv = "header\n5\t1\t1\t1\t1\tx\t0\t0\t1\t1\t90\tword\n";
        assert!(matches!(parse_tsv(tsv), Err(ProcessingError::Ocr(_))));

        let tsv = "header\n5\t1\t1\n";
        assert!(parse_tsv(tsv).is_err());
    }

    #[test]
    fn test_parse_tsv_column_count_error() {
        let err = parse_tsv("header\n5\t1\t1\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "OCR engine error: TSV line 2 has 3 columns, expected at least 11"
        );

        // The text column may be missing entirely.
        let boxes = parse_tsv("header\n5\t1\t1\t1\t1\t1\t4\t6\t10\t12\t90\n").unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_process_message_encodes_boxes() {
        let processor = OcrProcessor::new(FixedDetector(vec![TextBoundingBox::new("", 1, 2, 3, 4)]));
        let out = processor.process(b"").unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"text": "", "left": 1, "right": 2, "top": 3, "bottom": 4}])
        );
        assert_eq!(decode_boxes(&out).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let detector = TesseractDetector::new("/nonexistent/tesseract-binary", "eng");
        assert!(matches!(
            detector.detect_text(b"\x89PNG"),
            Err(ProcessingError::Io(_))
        ));
    }
}
