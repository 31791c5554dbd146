//! Extractor Service - Transcribes record-sheet photographs into raw CSV payloads
//!
//! Responsibilities:
//! - Walk a batch's image directory in lexicographic order
//! - Send each photograph to the vision model with the transcription prompt
//! - Isolate the bracket-delimited CSV block from the model's reply
//! - Store one transcription payload (plus metadata sidecar) per image
//! - Skip images whose content hash already has a stored transcription
//!
//! Usage:
//!   # Transcribe every new image in a batch:
//!   cargo run --bin extractor -- --batch-id 01_2025_3
//!
//!   # Re-transcribe everything, ignoring the cache:
//!   cargo run --bin extractor -- --batch-id 01_2025_3 --force

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Image extensions accepted as batch input.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

#[derive(Parser, Debug)]
#[command(name = "extractor", about = "Transcribes record-sheet photos via the vision API")]
struct Args {
    /// Batch identifier (MM_YYYY_N)
    #[arg(long)]
    batch_id: String,

    /// Confidence threshold (percent) below which the model flags a cell
    #[arg(long, default_value = "99.75")]
    confidence: f64,

    /// Force re-transcription even if a cached payload exists
    #[arg(long, default_value = "false")]
    force: bool,

    /// Dry run - walk the batch and report, but don't call the API or write files
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    api_key: Option<String>,
    data_root: PathBuf,
    model: String,
    max_tokens: u32,
    rate_limit_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            data_root: PathBuf::from(
                std::env::var("DATA_ROOT").unwrap_or_else(|_| "./data".to_string()),
            ),
            model: std::env::var("OCR_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20240620".to_string()),
            max_tokens: std::env::var("OCR_MAX_TOKENS")
                .unwrap_or_else(|_| "3200".to_string())
                .parse()
                .unwrap_or(3200),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        }
    }
}

/// Metadata sidecar stored next to each transcription payload. The cache key
/// is the image content hash: a renamed or edited photograph never reuses a
/// stale transcription.
#[derive(Debug, Serialize, Deserialize)]
struct TranscriptionMeta {
    image_file: String,
    content_hash: String,
    model: String,
    captured_at: DateTime<Utc>,
    comment: String,
}

/// Transcription prompt sent with every image. The confidence threshold is a
/// prompt parameter only; the reconciler consumes the resulting `*` markers
/// without assuming anything about how the model applied the threshold.
fn transcription_prompt(confidence: f64) -> String {
    format!(
        "Instruction 1: Convert the text in the image to csv.\n\
         Instruction 2: Employ a strict approach: add 1 asterisk next to the estimated values \
         for those cells whose text-to-digit conversion are below a {confidence} percent \
         confidence threshold; it does not matter if data is over-flagged.\n\
         Instruction 3: Include in comments the confidence threshold used.\n\
         Instruction 4: Do not use outlier-detection as criteria to flag the data.\n\
         Instruction 5: Make sure to not use outlier-detection as criteria to flag the data.\n\
         Instruction 6: If headers are present, include them. If no headers are found, do not \
         include any.\n\
         Instruction 7: Include any comments before returning output. Limit verbosity.\n\
         Instruction 8: Return output enclosed in brackets to facilitate parsing.\n\
         Instruction 9: Do not include any additional comments after final output."
    )
}

// =============================================================================
// API types - only the fields we read
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Split a model reply into (commentary, CSV payload). The payload is the
/// substring between the first `[` and the following `]`; the commentary is
/// whatever the model said before the opening bracket.
fn isolate_payload(reply: &str) -> Result<(String, String)> {
    let open = reply
        .find('[')
        .context("no opening bracket in model reply")?;
    let close = reply[open + 1..]
        .find(']')
        .context("no closing bracket in model reply")?;

    let comment = reply[..open].trim().to_string();
    let payload = reply[open + 1..open + 1 + close].trim().to_string();

    Ok((comment, payload))
}

/// Content hash of the image bytes, in the same `sha256:<hex>` form the
/// metadata sidecar records.
fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Check the metadata sidecar for an up-to-date cached transcription.
async fn cached_transcription(meta_path: &Path, hash: &str) -> Option<TranscriptionMeta> {
    let content = fs::read_to_string(meta_path).await.ok()?;
    let meta: TranscriptionMeta = serde_json::from_str(&content).ok()?;
    (meta.content_hash == hash).then_some(meta)
}

/// Call the vision API with one image and return the full text reply.
async fn transcribe_image(
    client: &reqwest::Client,
    config: &Config,
    api_key: &str,
    image_bytes: &[u8],
    prompt: &str,
) -> Result<String> {
    let body = serde_json::json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/jpeg",
                        "data": BASE64.encode(image_bytes),
                    },
                },
                { "type": "text", "text": prompt },
            ],
        }],
    });

    let resp = client
        .post(API_URL)
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .json(&body)
        .send()
        .await?
        .error_for_status()
        .context("vision API request failed")?;

    let parsed: ApiResponse = resp.json().await.context("malformed API response")?;
    let text = parsed
        .content
        .first()
        .map(|block| block.text.clone())
        .context("API response has no content blocks")?;

    Ok(text)
}

/// List the batch's images in lexicographic order. Ordering matters: the
/// reconciler's schema tracking is sequential over the same ordering.
async fn list_batch_images(images_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let mut entries = fs::read_dir(images_dir)
        .await
        .with_context(|| format!("cannot read image directory {}", images_dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some(e) if IMAGE_EXTENSIONS.contains(&e)) {
            images.push(path);
        }
    }

    images.sort();
    Ok(images)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    println!("=== Registro Lechero Extractor ===");
    println!("Batch: {}", args.batch_id);
    println!("Model: {}", config.model);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let batch_dir = config.data_root.join(&args.batch_id);
    let images_dir = batch_dir.join("images");
    let transcriptions_dir = batch_dir.join("transcriptions");

    if !args.dry_run {
        fs::create_dir_all(&transcriptions_dir).await?;
    }

    let images = list_batch_images(&images_dir).await?;
    if images.is_empty() {
        println!("No images found in {}", images_dir.display());
        return Ok(());
    }
    println!("Found {} image(s)", images.len());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;

    let prompt = transcription_prompt(args.confidence);

    let mut transcribed = 0;
    let mut cached = 0;
    let mut failed = 0;

    for image_path in &images {
        let file_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let stem = image_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        info!(file = %file_name, "processing image");

        let bytes = match fs::read(image_path).await {
            Ok(b) if !b.is_empty() => b,
            Ok(_) => {
                warn!(file = %file_name, "empty image file, skipping");
                failed += 1;
                continue;
            }
            Err(e) => {
                warn!(file = %file_name, error = %e, "cannot read image, skipping");
                failed += 1;
                continue;
            }
        };

        let hash = content_hash(&bytes);
        let payload_path = transcriptions_dir.join(format!("{stem}.txt"));
        let meta_path = transcriptions_dir.join(format!("{stem}.json"));

        if !args.force {
            if let Some(meta) = cached_transcription(&meta_path, &hash).await {
                debug!(file = %file_name, captured_at = %meta.captured_at, "cache hit");
                println!("  = cached: {file_name}");
                cached += 1;
                continue;
            }
        }

        if args.dry_run {
            println!("  ~ would transcribe: {file_name}");
            continue;
        }

        let api_key = config
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY env var missing")?;

        // Rate limit between API calls
        sleep(Duration::from_millis(config.rate_limit_ms)).await;

        let reply = match transcribe_image(&client, &config, api_key, &bytes, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(file = %file_name, error = %e, "transcription failed, skipping");
                println!("  x failed: {file_name}");
                failed += 1;
                continue;
            }
        };

        let (comment, payload) = match isolate_payload(&reply) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(file = %file_name, error = %e, "no CSV block in reply, skipping");
                println!("  x failed: {file_name}");
                failed += 1;
                continue;
            }
        };

        if !comment.is_empty() {
            info!(file = %file_name, comment = %comment, "model comment");
        }

        let meta = TranscriptionMeta {
            image_file: file_name.clone(),
            content_hash: hash,
            model: config.model.clone(),
            captured_at: Utc::now(),
            comment,
        };

        fs::write(&payload_path, &payload)
            .await
            .with_context(|| format!("cannot write {}", payload_path.display()))?;
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .await
            .with_context(|| format!("cannot write {}", meta_path.display()))?;

        println!("  + transcribed: {file_name}");
        transcribed += 1;
    }

    println!("\n=== Extraction Summary ===");
    println!("Transcribed: {transcribed}");
    println!("Cached: {cached}");
    println!("Failed: {failed}");
    if transcribed + cached > 0 {
        println!(
            "Ready for reconciliation: cargo run --bin reconciler -- --batch-id {}",
            args.batch_id
        );
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
