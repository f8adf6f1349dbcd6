//! JSON response bodies for the Encode, Enroll and Match operations.

use chrono::{DateTime, SecondsFormat, Utc};
use facematch_core::{
    Embedding, FailureCode, PipelineOutput, ProcessingMetadata, RejectReason, Verification,
};
use serde::Serialize;
use serde_json::Value;

const NO_FACE_IN_CAPTURE: &str =
    "No faces detected in image. Please position your face clearly in frame.";

#[derive(Debug, Serialize)]
pub struct EncodeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ProcessingMetadata,
}

impl From<PipelineOutput> for EncodeResponse {
    fn from(output: PipelineOutput) -> Self {
        let error = output
            .embedding
            .is_none()
            .then(|| failure_message(&output.metadata, "Failed to encode face"));
        Self {
            success: output.embedding.is_some(),
            embedding: output.embedding,
            error,
            metadata: output.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub identity: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ProcessingMetadata,
}

impl EnrollResponse {
    pub fn new(identity: Value, output: PipelineOutput, now: DateTime<Utc>) -> Self {
        match output.embedding {
            Some(embedding) => Self {
                success: true,
                message: Some("Face enrolled successfully".to_string()),
                identity,
                enrolled_at: Some(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
                embedding: Some(embedding),
                error: None,
                metadata: output.metadata,
            },
            None => Self {
                success: false,
                message: None,
                identity,
                enrolled_at: None,
                embedding: None,
                error: Some(failure_message(&output.metadata, "Failed to detect face")),
                metadata: output.metadata,
            },
        }
    }
}

/// Match outcome. `matched` is the acceptance decision: distance threshold
/// and confidence floor both passed.
#[derive(Debug, Serialize)]
pub struct MatchResponse {
    pub success: bool,
    pub matched: bool,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProcessingMetadata>,
}

impl From<Verification> for MatchResponse {
    fn from(verification: Verification) -> Self {
        let Some(verdict) = verification.verdict else {
            let error = match verification.metadata.code {
                Some(FailureCode::NoFaceDetected) => NO_FACE_IN_CAPTURE.to_string(),
                _ => failure_message(
                    &verification.metadata,
                    "Failed to detect face in captured image",
                ),
            };
            return Self {
                success: false,
                matched: false,
                confidence: 0.0,
                distance: None,
                threshold: None,
                message: None,
                reason: None,
                error: Some(error),
                metadata: Some(verification.metadata),
            };
        };

        Self {
            success: true,
            matched: verdict.accepted,
            confidence: round_to(verdict.result.confidence, 2),
            distance: Some(round_to(verdict.result.distance, 4)),
            threshold: Some(verdict.result.threshold),
            message: Some(verdict.message()),
            reason: verdict.reason,
            error: verdict.result.error.clone(),
            metadata: None,
        }
    }
}

fn failure_message(metadata: &ProcessingMetadata, fallback: &str) -> String {
    metadata
        .error
        .clone()
        .unwrap_or_else(|| fallback.to_string())
}

fn round_to(value: f32, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value as f64 * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use facematch_core::{AcceptancePolicy, EuclideanMatcher, Matcher, EMBEDDING_DIM};
    use serde_json::json;

    fn verdict_at(distance: f32, policy: AcceptancePolicy) -> Verification {
        let a = Embedding::new(vec![0.0; EMBEDDING_DIM]);
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = distance;
        let b = Embedding::new(values);
        let result = EuclideanMatcher.compare(&a, &b, policy.distance_threshold);
        Verification {
            metadata: ProcessingMetadata {
                faces_detected: 1,
                faces_encoded: 1,
                ..Default::default()
            },
            verdict: Some(policy.evaluate(result)),
        }
    }

    #[test]
    fn test_encode_failure_carries_metadata_error() {
        let out = PipelineOutput {
            embedding: None,
            metadata: ProcessingMetadata::default().failed(FailureCode::InvalidImage),
        };
        let body = serde_json::to_value(EncodeResponse::from(out)).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid image format");
        assert!(body.get("embedding").is_none());
    }

    #[test]
    fn test_enroll_success_echoes_identity() {
        let out = PipelineOutput {
            embedding: Some(Embedding::new(vec![0.5; EMBEDDING_DIM])),
            metadata: ProcessingMetadata::default(),
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let body = serde_json::to_value(EnrollResponse::new(json!("s-17"), out, now)).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["identity"], "s-17");
        assert_eq!(body["enrolledAt"], "2024-03-01T08:30:00.000Z");
        assert_eq!(body["message"], "Face enrolled successfully");
        assert_eq!(body["embedding"].as_array().unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_match_accepted_rounding() {
        let body = serde_json::to_value(MatchResponse::from(verdict_at(
            0.5,
            AcceptancePolicy::new(0.6, 70.0),
        )))
        .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["matched"], true);
        assert_eq!(body["confidence"], 75.0);
        assert_eq!(body["distance"], 0.5);
        assert_eq!(body["message"], "Face matched successfully");
    }

    #[test]
    fn test_match_rejected_on_confidence() {
        let resp = MatchResponse::from(verdict_at(0.7, AcceptancePolicy::new(1.0, 70.0)));
        assert!(resp.success);
        assert!(!resp.matched);
        assert_eq!(resp.reason, Some(RejectReason::ConfidenceBelowFloor));
        assert_eq!(resp.confidence, 65.0);
    }

    #[test]
    fn test_match_without_face() {
        let resp = MatchResponse::from(Verification {
            metadata: ProcessingMetadata::default().failed(FailureCode::NoFaceDetected),
            verdict: None,
        });
        assert!(!resp.success);
        assert!(!resp.matched);
        assert_eq!(resp.confidence, 0.0);
        assert_eq!(resp.error.as_deref(), Some(NO_FACE_IN_CAPTURE));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(66.666, 2), 66.67);
    }
}
