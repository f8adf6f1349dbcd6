//! Boundary validation for incoming JSON requests.
//!
//! Nothing malformed gets past this module: payloads are base64-decoded and
//! enrolled embeddings are dimension-checked before the engine sees them.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use facematch_core::{Embedding, EmbeddingError};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Shortest base64 payload that can plausibly hold an image.
pub const MIN_PAYLOAD_LEN: usize = 100;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing identity")]
    MissingIdentity,
    #[error("Base64 data incomplete or corrupted ({0} characters)")]
    PayloadTooShort(usize),
    #[error("Failed to decode image: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid enrolled embedding dimension: expected 128, got {0}")]
    EmbeddingDimension(usize),
    #[error("Invalid enrolled embedding: {0}")]
    Embedding(EmbeddingError),
    #[error("invalid threshold {0}: must be between 0.0 and 2.0")]
    InvalidThreshold(f64),
}

#[derive(Deserialize)]
struct EncodeBody {
    image: String,
}

#[derive(Deserialize)]
struct EnrollBody {
    image: String,
    #[serde(alias = "studentId")]
    identity: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchBody {
    enrolled_embedding: Vec<f32>,
    captured_image: String,
    #[serde(default)]
    threshold: Option<f64>,
}

/// A validated Enroll request. `identity` is opaque and echoed unchanged.
#[derive(Debug)]
pub struct EnrollRequest {
    pub identity: Value,
    pub image: Vec<u8>,
}

/// A validated Match request.
#[derive(Debug)]
pub struct MatchRequest {
    pub enrolled: Embedding,
    pub image: Vec<u8>,
    pub threshold: Option<f32>,
}

/// Parse `{"image": "<base64>"}` into image bytes.
pub fn parse_encode(body: &str) -> Result<Vec<u8>, RequestError> {
    let body: EncodeBody = serde_json::from_str(body)?;
    decode_payload(&body.image)
}

/// Parse `{"image": "<base64>", "identity": <any>}`.
pub fn parse_enroll(body: &str) -> Result<EnrollRequest, RequestError> {
    let body: EnrollBody = serde_json::from_str(body)?;
    if body.identity.is_null() {
        return Err(RequestError::MissingIdentity);
    }
    Ok(EnrollRequest {
        identity: body.identity,
        image: decode_payload(&body.image)?,
    })
}

/// Parse `{"enrolledEmbedding": [...128 numbers], "capturedImage": "<base64>", "threshold"?: n}`.
pub fn parse_match(body: &str) -> Result<MatchRequest, RequestError> {
    let body: MatchBody = serde_json::from_str(body)?;

    let enrolled = Embedding::new(body.enrolled_embedding);
    match enrolled.validate() {
        Ok(()) => {}
        Err(EmbeddingError::WrongDimension { actual, .. }) => {
            return Err(RequestError::EmbeddingDimension(actual))
        }
        Err(e) => return Err(RequestError::Embedding(e)),
    }

    let threshold = match body.threshold {
        None => None,
        Some(t) if t.is_finite() && (0.0..=2.0).contains(&t) => Some(t as f32),
        Some(t) => return Err(RequestError::InvalidThreshold(t)),
    };

    Ok(MatchRequest {
        enrolled,
        image: decode_payload(&body.captured_image)?,
        threshold,
    })
}

/// Decode a base64 image payload.
///
/// Accepts an optional `data:<mime>;base64,` prefix and repairs missing
/// `=` padding.
pub fn decode_payload(raw: &str) -> Result<Vec<u8>, RequestError> {
    let trimmed = raw.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(trimmed, |(_, data)| data),
        None => trimmed,
    };

    if payload.len() < MIN_PAYLOAD_LEN {
        tracing::warn!(len = payload.len(), "base64 payload too short");
        return Err(RequestError::PayloadTooShort(payload.len()));
    }

    let missing = payload.len() % 4;
    let bytes = if missing == 0 {
        BASE64_STANDARD.decode(payload)?
    } else {
        let mut padded = String::with_capacity(payload.len() + 4 - missing);
        padded.push_str(payload);
        padded.extend(std::iter::repeat('=').take(4 - missing));
        BASE64_STANDARD.decode(padded)?
    };

    tracing::debug!(encoded = payload.len(), decoded = bytes.len(), "payload decoded");
    Ok(bytes)
}
