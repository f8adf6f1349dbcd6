use crate::detector::DetectionMode;
use crate::matcher::{AcceptancePolicy, DEFAULT_DISTANCE_THRESHOLD, DEFAULT_MIN_CONFIDENCE};
use crate::pipeline::SelectionStrategy;
use crate::types::ChannelOrder;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, loaded from `FACEMATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Detector model file name inside `model_dir`.
    pub detector_model: String,
    /// Embedding model file name inside `model_dir`.
    pub encoder_model: String,
    /// Square input resolution of the embedding network.
    pub encoder_input_size: u32,
    /// Channel order the embedding network was trained on.
    pub encoder_channel_order: ChannelOrder,
    pub detection_mode: DetectionMode,
    /// Maximum Euclidean distance for a match (0.0–2.0).
    pub distance_threshold: f32,
    /// Minimum confidence percentage for acceptance (0–100).
    pub min_confidence: f32,
    pub selection: SelectionStrategy,
    /// Number of pipeline workers.
    pub max_workers: usize,
    /// Requests that may wait for a free worker.
    pub queue_depth: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Deadline a caller waits for one request.
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_model_dir);

        Self {
            model_dir,
            detector_model: lookup("FACEMATCH_DETECTOR_MODEL")
                .unwrap_or_else(|| "det_10g.onnx".to_string()),
            encoder_model: lookup("FACEMATCH_ENCODER_MODEL")
                .unwrap_or_else(|| "face_embedding_128.onnx".to_string()),
            encoder_input_size: parsed(&lookup, "FACEMATCH_ENCODER_INPUT_SIZE", 160u32).max(1),
            encoder_channel_order: parsed(
                &lookup,
                "FACEMATCH_ENCODER_CHANNEL_ORDER",
                ChannelOrder::Rgb,
            ),
            detection_mode: parsed(&lookup, "FACEMATCH_DETECTION_MODE", DetectionMode::Fast),
            distance_threshold: ranged(
                &lookup,
                "FACEMATCH_DISTANCE_THRESHOLD",
                DEFAULT_DISTANCE_THRESHOLD,
                0.0,
                2.0,
            ),
            min_confidence: ranged(
                &lookup,
                "FACEMATCH_MIN_CONFIDENCE",
                DEFAULT_MIN_CONFIDENCE,
                0.0,
                100.0,
            ),
            selection: parsed(&lookup, "FACEMATCH_SELECTION", SelectionStrategy::FirstFound),
            max_workers: parsed(&lookup, "FACEMATCH_MAX_WORKERS", 4usize).max(1),
            queue_depth: parsed(&lookup, "FACEMATCH_QUEUE_DEPTH", 16usize).max(1),
            intra_threads: parsed(&lookup, "FACEMATCH_INTRA_THREADS", 1usize).max(1),
            request_timeout: Duration::from_secs(
                parsed(&lookup, "FACEMATCH_REQUEST_TIMEOUT_SECS", 10u64).max(1),
            ),
        }
    }

    pub fn policy(&self) -> AcceptancePolicy {
        AcceptancePolicy::new(self.distance_threshold, self.min_confidence)
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join(&self.encoder_model)
            .to_string_lossy()
            .into_owned()
    }
}

/// `$XDG_DATA_HOME/facematch/models`, or `~/.local/share/facematch/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch/models")
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value; using default");
            default
        }),
    }
}

fn ranged(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f32,
    min: f32,
    max: f32,
) -> f32 {
    let value = parsed(lookup, key, default);
    if (min..=max).contains(&value) {
        value
    } else {
        tracing::warn!(key, value, min, max, "value out of range; using default");
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[("FACEMATCH_MODEL_DIR", "/models")]);
        assert_eq!(config.detection_mode, DetectionMode::Fast);
        assert_eq!(config.distance_threshold, 0.6);
        assert_eq!(config.min_confidence, 70.0);
        assert_eq!(config.selection, SelectionStrategy::FirstFound);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.encoder_input_size, 160);
        assert_eq!(config.encoder_channel_order, ChannelOrder::Rgb);
        assert_eq!(config.detector_model_path(), "/models/det_10g.onnx");
        assert_eq!(config.encoder_model_path(), "/models/face_embedding_128.onnx");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("FACEMATCH_DETECTION_MODE", "cnn"),
            ("FACEMATCH_DISTANCE_THRESHOLD", "0.45"),
            ("FACEMATCH_MIN_CONFIDENCE", "80"),
            ("FACEMATCH_SELECTION", "best-score"),
            ("FACEMATCH_MAX_WORKERS", "2"),
            ("FACEMATCH_ENCODER_INPUT_SIZE", "112"),
            ("FACEMATCH_ENCODER_CHANNEL_ORDER", "BGR"),
        ]);
        assert_eq!(config.encoder_input_size, 112);
        assert_eq!(config.encoder_channel_order, ChannelOrder::Bgr);
        assert_eq!(config.detection_mode, DetectionMode::Accurate);
        assert_eq!(config.distance_threshold, 0.45);
        assert_eq!(config.selection, SelectionStrategy::HighestScore);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.policy(), AcceptancePolicy::new(0.45, 80.0));
    }

    #[test]
    fn test_invalid_and_out_of_range_fall_back() {
        let config = from_pairs(&[
            ("FACEMATCH_DISTANCE_THRESHOLD", "2.5"),
            ("FACEMATCH_MIN_CONFIDENCE", "lots"),
            ("FACEMATCH_DETECTION_MODE", "turbo"),
            ("FACEMATCH_MAX_WORKERS", "0"),
            ("FACEMATCH_ENCODER_CHANNEL_ORDER", "yuv"),
            ("FACEMATCH_ENCODER_INPUT_SIZE", "-3"),
        ]);
        assert_eq!(config.encoder_channel_order, ChannelOrder::Rgb);
        assert_eq!(config.encoder_input_size, 160);
        assert_eq!(config.distance_threshold, 0.6);
        assert_eq!(config.min_confidence, 70.0);
        assert_eq!(config.detection_mode, DetectionMode::Fast);
        assert_eq!(config.max_workers, 1);
    }
}
