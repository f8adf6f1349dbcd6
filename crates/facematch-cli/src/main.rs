use anyhow::{bail, Context, Result};
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use facematch_core::{AcceptancePolicy, Config, Embedding, EuclideanMatcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facematch.Verifier1",
    default_service = "org.facematch.Verifier1",
    default_path = "/org/facematch/Verifier1"
)]
trait Verifier {
    fn encode(&self, request: &str) -> zbus::Result<String>;
    fn enroll(&self, request: &str) -> zbus::Result<String>;
    fn match_face(&self, request: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "Face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and encode the face in an image
    Encode {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Encode a face for enrolment under an identity token
    Enroll {
        /// Identity echoed back in the response
        #[arg(short, long)]
        identity: String,
        image: PathBuf,
    },
    /// Verify an image against an enrolled embedding
    Match {
        /// JSON file holding the enrolled embedding
        #[arg(short, long)]
        enrolled: PathBuf,
        /// Distance threshold override (0.0-2.0)
        #[arg(short, long)]
        threshold: Option<f32>,
        image: PathBuf,
    },
    /// Compare two stored embeddings without the daemon
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Confidence floor in percent
        #[arg(long)]
        min_confidence: Option<f32>,
    },
    /// Show daemon status
    Status,
}

/// An embedding file: a bare array, or any object with an `embedding` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Wrapped { embedding: Vec<f32> },
}

fn parse_embedding(json: &str) -> Result<Embedding> {
    let values = match serde_json::from_str(json)? {
        EmbeddingFile::Bare(values) => values,
        EmbeddingFile::Wrapped { embedding } => embedding,
    };
    let embedding = Embedding::new(values);
    embedding.validate()?;
    Ok(embedding)
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_embedding(&json).with_context(|| format!("invalid embedding in {}", path.display()))
}

fn read_image_b64(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(BASE64_STANDARD.encode(bytes))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn proxy() -> Result<VerifierProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to session bus")?;
    Ok(VerifierProxy::new(&conn).await?)
}

/// Compare two embedding files under `base` (the configured policy),
/// with optional per-run overrides.
fn compare(
    a: &Path,
    b: &Path,
    threshold: Option<f32>,
    min_confidence: Option<f32>,
    base: AcceptancePolicy,
) -> Result<serde_json::Value> {
    if let Some(t) = threshold {
        if !(0.0..=2.0).contains(&t) {
            bail!("threshold must be between 0.0 and 2.0, got {t}");
        }
    }
    let mut policy = base;
    if let Some(c) = min_confidence {
        if !(0.0..=100.0).contains(&c) {
            bail!("min confidence must be between 0 and 100, got {c}");
        }
        policy.min_confidence = c;
    }

    let reference = read_embedding(a)?;
    let probe = read_embedding(b)?;
    let verdict = policy.decide(&EuclideanMatcher, &reference, &probe, threshold);
    tracing::debug!(?verdict, "offline comparison");

    Ok(serde_json::json!({
        "matched": verdict.accepted,
        "distance": verdict.result.distance,
        "confidence": verdict.result.confidence,
        "threshold": verdict.result.threshold,
        "message": verdict.message(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode { image } => {
            let request = serde_json::json!({ "image": read_image_b64(&image)? });
            print_json(&proxy().await?.encode(&request.to_string()).await?)?;
        }
        Commands::Enroll { identity, image } => {
            let request = serde_json::json!({
                "image": read_image_b64(&image)?,
                "identity": identity,
            });
            print_json(&proxy().await?.enroll(&request.to_string()).await?)?;
        }
        Commands::Match {
            enrolled,
            threshold,
            image,
        } => {
            let embedding = read_embedding(&enrolled)?;
            let mut request = serde_json::json!({
                "enrolledEmbedding": embedding.values(),
                "capturedImage": read_image_b64(&image)?,
            });
            if let Some(t) = threshold {
                request["threshold"] = t.into();
            }
            print_json(&proxy().await?.match_face(&request.to_string()).await?)?;
        }
        Commands::Compare {
            a,
            b,
            threshold,
            min_confidence,
        } => {
            let policy = Config::from_env().policy();
            let result = compare(&a, &b, threshold, min_confidence, policy)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => match proxy().await {
            Ok(proxy) => print_json(&proxy.status().await?)?,
            Err(e) => {
                tracing::debug!(error = %e, "status unavailable");
                println!("facematchd: not connected");
            }
        },
    }

    Ok(())
}
