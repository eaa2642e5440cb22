//! Core types for the pipeline stages.

mod config;
mod message;
mod text_box;

pub use config::{
    BrokerSettings, FailurePolicy, OcrSettings, PiiFilterSettings, Settings, SubmitSettings,
    DEFAULT_CONFIG_FILE, ENV_PREFIX,
};
pub use message::{CorrelationId, Delivery};
pub use text_box::{decode_boxes, encode_boxes, TextBoundingBox};
