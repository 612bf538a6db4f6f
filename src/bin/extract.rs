use bank_detail_extractor::config::AppConfig;
use bank_detail_extractor::models::{ExtractionResult, NoticeLevel};
use bank_detail_extractor::services::extraction::{ExtractionService, ExtractionSettings};
use bank_detail_extractor::services::gemini::GeminiClient;
use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

/// Extract sort code and account number from a bank document image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// png, jpg or jpeg image to send
    image: PathBuf,

    /// Gemini model (overrides GEMINI_MODEL)
    #[arg(short, long)]
    model: Option<String>,

    /// Seconds to wait for the uploaded file to become active
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Milliseconds between file status checks
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the result
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extract=info,bank_detail_extractor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = AppConfig::from_env();
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(secs) = args.timeout_secs {
        config.poll_timeout_secs = secs;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    config.validate()?;

    let data = tokio::fs::read(&args.image).await?;
    let filename = args
        .image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    let content_type = infer::get(&data).map(|kind| kind.mime_type());

    let gemini = Arc::new(GeminiClient::from_config(&config)?);
    let service = ExtractionService::new(gemini, ExtractionSettings::from(&config));

    info!(
        "🔎 Extracting from {} with {} (timeout {:?})",
        args.image.display(),
        config.model,
        Duration::from_secs(config.poll_timeout_secs)
    );
    let outcome = service
        .extract(&filename, content_type, &data)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    for notice in &outcome.notices {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => info!("{}", notice.message),
            NoticeLevel::Warning => warn!("{}", notice.message),
            NoticeLevel::Error => error!("{}", notice.message),
        }
    }

    match outcome.result {
        ExtractionResult::Parsed(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        ExtractionResult::Raw(text) => println!("{}", text),
    }

    Ok(())
}
