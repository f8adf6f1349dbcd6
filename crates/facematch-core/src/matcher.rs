//! Match decisions: distance, calibrated confidence, and acceptance policy.

use crate::types::{Embedding, MatchResult};
use serde::{Deserialize, Serialize};

/// Distance reported when a comparison could not be performed.
pub const SENTINEL_DISTANCE: f32 = 2.0;

/// Default maximum distance still considered the same face.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Default confidence floor, in percent.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 70.0;

/// Fixed linear calibration: distance 0 is 100%, distance 2 and beyond is 0%.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (100.0 * (1.0 - distance / 2.0)).clamp(0.0, 100.0)
}

/// Strategy for comparing two embeddings under a distance threshold.
pub trait Matcher {
    fn compare(&self, reference: &Embedding, probe: &Embedding, threshold: f32) -> MatchResult;
}

/// Euclidean (L2) distance matcher.
///
/// Never panics or errors: malformed input yields a maximally dissimilar
/// result with `error` set.
pub struct EuclideanMatcher;

impl EuclideanMatcher {
    fn sentinel(threshold: f32, error: String) -> MatchResult {
        tracing::warn!(%error, "embedding comparison failed");
        MatchResult {
            matched: false,
            distance: SENTINEL_DISTANCE,
            confidence: 0.0,
            threshold,
            error: Some(error),
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, reference: &Embedding, probe: &Embedding, threshold: f32) -> MatchResult {
        if reference.len() != probe.len() {
            return Self::sentinel(
                threshold,
                format!(
                    "embedding length mismatch: {} vs {}",
                    reference.len(),
                    probe.len()
                ),
            );
        }
        if reference.is_empty() {
            return Self::sentinel(threshold, "cannot compare empty embeddings".into());
        }

        let distance = reference.euclidean_distance(probe);
        if !distance.is_finite() {
            return Self::sentinel(threshold, "embedding contains non-finite values".into());
        }

        MatchResult {
            matched: distance <= threshold,
            distance,
            confidence: confidence_from_distance(distance),
            threshold,
            error: None,
        }
    }
}

/// Why a comparison was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ComparisonFailed,
    DistanceAboveThreshold,
    ConfidenceBelowFloor,
}

/// Final decision on one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub result: MatchResult,
}

impl Verdict {
    pub fn message(&self) -> String {
        match self.reason {
            None => "Face matched successfully".to_string(),
            Some(RejectReason::ComparisonFailed) => format!(
                "Face comparison failed: {}",
                self.result.error.as_deref().unwrap_or("unknown error")
            ),
            Some(RejectReason::DistanceAboveThreshold) => format!(
                "Face distance {:.4} exceeds threshold {:.4}",
                self.result.distance, self.result.threshold
            ),
            Some(RejectReason::ConfidenceBelowFloor) => format!(
                "Face confidence {:.1}% below threshold",
                self.result.confidence
            ),
        }
    }
}

/// Two independent gates: the distance verdict and a confidence floor.
/// Both must pass for acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptancePolicy {
    /// Default distance threshold, overridable per comparison.
    pub distance_threshold: f32,
    /// Minimum confidence percentage.
    pub min_confidence: f32,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl AcceptancePolicy {
    pub fn new(distance_threshold: f32, min_confidence: f32) -> Self {
        Self {
            distance_threshold,
            min_confidence,
        }
    }

    /// Compare with `threshold` (or the policy default) and gate the result.
    pub fn decide(
        &self,
        matcher: &impl Matcher,
        reference: &Embedding,
        probe: &Embedding,
        threshold: Option<f32>,
    ) -> Verdict {
        let threshold = threshold.unwrap_or(self.distance_threshold);
        self.evaluate(matcher.compare(reference, probe, threshold))
    }

    pub fn evaluate(&self, result: MatchResult) -> Verdict {
        let reason = if result.error.is_some() {
            Some(RejectReason::ComparisonFailed)
        } else if !result.matched {
            Some(RejectReason::DistanceAboveThreshold)
        } else if result.confidence < self.min_confidence {
            Some(RejectReason::ConfidenceBelowFloor)
        } else {
            None
        };

        Verdict {
            accepted: reason.is_none(),
            reason,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    fn offset(distance: f32) -> (Embedding, Embedding) {
        let a = vec![0.0; EMBEDDING_DIM];
        let mut b = vec![0.0; EMBEDDING_DIM];
        b[0] = distance;
        (Embedding::new(a), Embedding::new(b))
    }

    #[test]
    fn test_identical_embeddings() {
        let e = Embedding::new((0..EMBEDDING_DIM).map(|i| i as f32 / 512.0).collect());
        for threshold in [0.01, 0.6, 2.0] {
            let r = EuclideanMatcher.compare(&e, &e, threshold);
            assert_eq!(r.distance, 0.0);
            assert_eq!(r.confidence, 100.0);
            assert!(r.matched);
            assert!(r.error.is_none());
        }
    }

    #[test]
    fn test_confidence_calibration() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert_eq!(confidence_from_distance(0.5), 75.0);
        assert_eq!(confidence_from_distance(1.0), 50.0);
        assert_eq!(confidence_from_distance(2.0), 0.0);
        assert_eq!(confidence_from_distance(7.5), 0.0);
    }

    #[test]
    fn test_confidence_monotonic_and_bounded() {
        let mut prev = f32::INFINITY;
        for step in 0..=400 {
            let c = confidence_from_distance(step as f32 * 0.01);
            assert!((0.0..=100.0).contains(&c));
            assert!(c <= prev);
            prev = c;
        }
    }

    #[test]
    fn test_large_magnitude_input_clamped() {
        let (a, b) = offset(1.0e6);
        let r = EuclideanMatcher.compare(&a, &b, 0.6);
        assert_eq!(r.confidence, 0.0);
        assert!(!r.matched);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_huge_finite_values_compare_without_error() {
        let a = Embedding::new(vec![2e19; EMBEDDING_DIM]);
        let b = Embedding::new(vec![-2e19; EMBEDDING_DIM]);
        let r = EuclideanMatcher.compare(&a, &b, 0.6);
        assert!(r.error.is_none());
        assert!(r.distance.is_finite() && r.distance > SENTINEL_DISTANCE);
        assert_eq!(r.confidence, 0.0);

        let verdict = AcceptancePolicy::default().evaluate(r);
        assert_eq!(verdict.reason, Some(RejectReason::DistanceAboveThreshold));
    }

    #[test]
    fn test_matched_iff_distance_within_threshold() {
        let (a, b) = offset(0.5);
        for (threshold, expected) in [(0.0, false), (0.49, false), (0.5, true), (0.6, true)] {
            let r = EuclideanMatcher.compare(&a, &b, threshold);
            assert_eq!(r.matched, expected, "threshold {threshold}");
            assert_eq!(r.threshold, threshold);
        }
    }

    #[test]
    fn test_length_mismatch_yields_sentinel() {
        let a = Embedding::new(vec![0.0; EMBEDDING_DIM]);
        let b = Embedding::new(vec![0.0; 64]);
        let r = EuclideanMatcher.compare(&a, &b, 0.6);
        assert!(!r.matched);
        assert_eq!(r.distance, SENTINEL_DISTANCE);
        assert_eq!(r.confidence, 0.0);
        assert!(r.error.is_some());
    }

    #[test]
    fn test_non_finite_yields_sentinel() {
        let (a, b) = offset(0.0);
        let mut values = b.into_values();
        values[3] = f32::NAN;
        let b = Embedding::new(values);
        let r = EuclideanMatcher.compare(&a, &b, 0.6);
        assert_eq!(r.distance, SENTINEL_DISTANCE);
        assert!(!r.matched);
    }

    #[test]
    fn test_empty_yields_sentinel() {
        let e = Embedding::new(Vec::new());
        let r = EuclideanMatcher.compare(&e, &e, 0.6);
        assert_eq!(r.distance, SENTINEL_DISTANCE);
        assert!(r.error.is_some());
    }

    #[test]
    fn test_policy_accepts_when_both_gates_pass() {
        let policy = AcceptancePolicy::new(0.6, 70.0);
        let (a, b) = offset(0.5);
        let v = policy.decide(&EuclideanMatcher, &a, &b, None);
        assert!(v.accepted);
        assert_eq!(v.reason, None);
        assert_eq!(v.result.confidence, 75.0);
        assert_eq!(v.message(), "Face matched successfully");
    }

    #[test]
    fn test_policy_rejects_on_distance() {
        let policy = AcceptancePolicy::new(0.6, 0.0);
        let (a, b) = offset(0.65);
        let v = policy.decide(&EuclideanMatcher, &a, &b, None);
        assert!(!v.accepted);
        assert_eq!(v.reason, Some(RejectReason::DistanceAboveThreshold));
    }

    #[test]
    fn test_policy_rejects_on_confidence_floor() {
        // distance 0.7 is within a loose threshold but only 65% confident
        let policy = AcceptancePolicy::new(1.0, 70.0);
        let (a, b) = offset(0.7);
        let v = policy.decide(&EuclideanMatcher, &a, &b, None);
        assert!(v.result.matched);
        assert!(!v.accepted);
        assert_eq!(v.reason, Some(RejectReason::ConfidenceBelowFloor));
        assert_eq!(v.message(), "Face confidence 65.0% below threshold");
    }

    #[test]
    fn test_policy_threshold_override() {
        let policy = AcceptancePolicy::new(0.6, 0.0);
        let (a, b) = offset(0.65);
        let v = policy.decide(&EuclideanMatcher, &a, &b, Some(0.7));
        assert!(v.accepted);
        assert_eq!(v.result.threshold, 0.7);
    }

    #[test]
    fn test_policy_rejects_failed_comparison() {
        let policy = AcceptancePolicy::new(2.0, 0.0);
        let a = Embedding::new(vec![0.0; 3]);
        let b = Embedding::new(vec![0.0; 4]);
        let v = policy.decide(&EuclideanMatcher, &a, &b, None);
        assert!(!v.accepted);
        assert_eq!(v.reason, Some(RejectReason::ComparisonFailed));
    }
}
