//! Redactor Pipeline Library
//!
//! Broker-connected services that run OCR on images and strip personally
//! identifiable terms from the recognised text. Stages talk to each other
//! only through RabbitMQ queues and exchanges and can be replicated freely.

pub mod client;
pub mod error;
pub mod matching;
pub mod messaging;
pub mod processing;
pub mod shutdown;
pub mod stages;
pub mod types;

pub use client::{RedactedResult, ResultWatcher, SubmitConfig, Submitter};
pub use error::{BrokerError, ClientError, ProcessingError, Result, StageError};
pub use matching::{BroadcastMatcher, MatchBuffer, MatcherConfig};
pub use messaging::{BrokerChannel, InMemoryBroker, PublishOutcome, RabbitChannel, RabbitConfig};
pub use processing::{JoinProcessor, OcrProcessor, PiiFilterProcessor, Processor, TesseractDetector};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use stages::{CorrelatingStage, CorrelatingStageConfig, PipelineStage, ReliableStage, ReliableStageConfig};
pub use types::{CorrelationId, Delivery, FailurePolicy, Settings, TextBoundingBox};

/// Default number of unmatched broadcast payloads a filter replica may hold
pub const DEFAULT_UNRESOLVED_BUFFER: usize = 15;

/// Default interval between broadcast queue depth checks (ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
