//! Redactor - Main Entry Point
//!
//! One binary for every pipeline role. Stage commands run until SIGINT or
//! SIGTERM, finish the message in flight and exit.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redactor::shutdown::wait_for_signal;
use redactor::{
    CorrelatingStage, CorrelatingStageConfig, OcrProcessor, PiiFilterProcessor, PipelineStage,
    RabbitChannel, RabbitConfig, ReliableStage, ReliableStageConfig, ResultWatcher, Settings,
    Shutdown, SubmitConfig, Submitter, TesseractDetector,
};

/// OCR and PII redaction pipeline over RabbitMQ.
#[derive(Parser, Debug)]
#[command(name = "redactor")]
#[command(about = "OCR and PII redaction pipeline stages", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the OCR stage
    Ocr,

    /// Run the PII filter stage
    PiiFilter,

    /// Submit an image with the terms to redact and print its correlation id
    Submit {
        /// Image file to run OCR on
        image: PathBuf,

        /// Terms to remove from the recognised text (case-insensitive)
        terms: Vec<String>,
    },

    /// Print redacted results as they arrive
    Watch,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Ocr => "ocr",
            Command::PiiFilter => "pii-filter",
            Command::Submit { .. } => "submit",
            Command::Watch => "watch",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "redactor=info".into()),
    );
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(command: Command) -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Starting redactor {} v{}", command.name(), env!("CARGO_PKG_VERSION"));

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => trigger.trigger(),
            Err(e) => error!(error = %e, "Could not install signal handlers"),
        }
    });

    match command {
        Command::Ocr => {
            let detector = TesseractDetector::from_settings(&settings.ocr);
            let stage = ReliableStage::declare(
                connect(&settings).await?,
                OcrProcessor::new(detector),
                ReliableStageConfig::ocr(&settings),
            )
            .await
            .context("Failed to declare OCR topology")?;
            run_stage(stage, shutdown).await
        }
        Command::PiiFilter => {
            let stage = CorrelatingStage::declare(
                connect(&settings).await?,
                PiiFilterProcessor,
                CorrelatingStageConfig::pii_filter(&settings),
            )
            .await
            .context("Failed to declare PII filter topology")?;
            run_stage(stage, shutdown).await
        }
        Command::Submit { image, terms } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read {}", image.display()))?;

            let submitter =
                Submitter::declare(connect(&settings).await?, SubmitConfig::from_settings(&settings))
                    .await?;
            let id = submitter.submit(&bytes, &terms).await?;
            println!("{id}");
            Ok(())
        }
        Command::Watch => {
            let watcher =
                ResultWatcher::declare(connect(&settings).await?, &settings.pii_filter.output_exchange)
                    .await?;
            info!(queue = %watcher.queue(), "Watching for results");
            let seen = watcher
                .run(shutdown, |result| {
                    let texts: Vec<&str> = result.boxes.iter().map(|b| b.text.as_str()).collect();
                    info!(correlation_id = %result.correlation_id, ?texts, "Received result");
                })
                .await?;
            info!(results = seen, "Stopped watching");
            Ok(())
        }
    }
}

async fn connect(settings: &Settings) -> Result<RabbitChannel> {
    RabbitChannel::connect(RabbitConfig::new(settings.broker.amqp_uri()))
        .await
        .with_context(|| {
            format!(
                "Failed to connect to RabbitMQ at {}:{}",
                settings.broker.host, settings.broker.port
            )
        })
}

async fn run_stage<S: PipelineStage>(mut stage: S, shutdown: Shutdown) -> Result<()> {
    let name = stage.name().to_string();
    stage
        .run(shutdown)
        .await
        .with_context(|| format!("Stage {name} failed"))?;
    info!(stage = %name, "Shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage_commands() {
        let cli = Cli::try_parse_from(["redactor", "pii-filter"]).unwrap();
        assert_eq!(cli.command, Command::PiiFilter);
        assert_eq!(cli.command.name(), "pii-filter");

        let cli = Cli::try_parse_from(["redactor", "ocr"]).unwrap();
        assert_eq!(cli.command, Command::Ocr);
    }

    #[test]
    fn test_parse_submit_with_terms() {
        let cli = Cli::try_parse_from(["redactor", "submit", "page.png", "Alice", "Snowdrop"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Submit {
                image: PathBuf::from("page.png"),
                terms: vec!["Alice".to_string(), "Snowdrop".to_string()],
            }
        );

        // No terms is a valid submission.
        let cli = Cli::try_parse_from(["redactor", "submit", "page.png"]).unwrap();
        assert!(matches!(cli.command, Command::Submit { terms, .. } if terms.is_empty()));
    }

    #[test]
    fn test_rejects_bad_invocations() {
        assert!(Cli::try_parse_from(["redactor"]).is_err());
        assert!(Cli::try_parse_from(["redactor", "resize"]).is_err());
        assert!(Cli::try_parse_from(["redactor", "submit"]).is_err());
        assert!(Cli::try_parse_from(["redactor", "watch", "extra"]).is_err());
    }
}
