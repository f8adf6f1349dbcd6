//! Pipeline orchestration: bytes → faces → embeddings → (optional) verdict.
//!
//! Every entry point returns a structured value; failures are reported in
//! [`ProcessingMetadata`] instead of as errors.

use crate::detector::{Detector, FaceLocalizer};
use crate::encoder::{EmbeddingGenerator, Encoder};
use crate::matcher::{AcceptancePolicy, EuclideanMatcher, Verdict};
use crate::types::{ChannelOrder, Embedding, FaceRegion, FailureCode, Image, ProcessingMetadata};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which encoded face becomes the primary result when several are found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// First successfully encoded face in localizer order.
    #[default]
    FirstFound,
    /// Encoded face with the highest detector score; ties and unscored
    /// regions keep localizer order.
    HighestScore,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::FirstFound => f.write_str("first-found"),
            SelectionStrategy::HighestScore => f.write_str("highest-score"),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-found" => Ok(SelectionStrategy::FirstFound),
            "best" | "best-score" | "highest-score" => Ok(SelectionStrategy::HighestScore),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

/// Result of [`FacePipeline::process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub embedding: Option<Embedding>,
    pub metadata: ProcessingMetadata,
}

/// Result of [`FacePipeline::verify`]. `verdict` is `None` when the live
/// capture produced no embedding; `metadata` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub metadata: ProcessingMetadata,
    pub verdict: Option<Verdict>,
}

/// Decode any format the `image` crate recognizes into 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Option<Image> {
    match image::load_from_memory(bytes) {
        Ok(decoded) => {
            let rgb = decoded.to_rgb8();
            let (width, height) = rgb.dimensions();
            Image::from_raw(width, height, ChannelOrder::Rgb, rgb.into_raw())
        }
        Err(e) => {
            tracing::error!(error = %e, len = bytes.len(), "failed to decode image");
            None
        }
    }
}

/// Stateless face pipeline over one detector and one encoder.
///
/// Holds no per-request state; each call owns its image, regions and
/// embeddings. Methods take `&mut self`; run one instance per worker.
pub struct FacePipeline<D, E> {
    localizer: FaceLocalizer<D>,
    generator: EmbeddingGenerator<E>,
    selection: SelectionStrategy,
    policy: AcceptancePolicy,
}

impl<D: Detector, E: Encoder> FacePipeline<D, E> {
    pub fn new(detector: D, encoder: E) -> Self {
        Self {
            localizer: FaceLocalizer::new(detector),
            generator: EmbeddingGenerator::new(encoder),
            selection: SelectionStrategy::default(),
            policy: AcceptancePolicy::default(),
        }
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_policy(mut self, policy: AcceptancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &AcceptancePolicy {
        &self.policy
    }

    /// Decode, locate, and encode every face; pick the primary embedding.
    pub fn process(&mut self, bytes: &[u8]) -> PipelineOutput {
        let _span = tracing::debug_span!("process", len = bytes.len()).entered();

        let Some(image) = decode_image(bytes) else {
            return PipelineOutput {
                embedding: None,
                metadata: ProcessingMetadata::default().failed(FailureCode::InvalidImage),
            };
        };

        let mut metadata = ProcessingMetadata {
            image_shape: Some(image.shape()),
            ..Default::default()
        };

        let regions = self.localizer.locate(&image);
        metadata.faces_detected = regions.len();
        if regions.is_empty() {
            tracing::info!("no faces detected");
            return PipelineOutput {
                embedding: None,
                metadata: metadata.failed(FailureCode::NoFaceDetected),
            };
        }

        // Whole image plus region, converted once to the oracle's order.
        let oracle_view = image.to_order(self.generator.channel_order());
        let encoded: Vec<(FaceRegion, Embedding)> = regions
            .into_iter()
            .filter_map(|region| {
                self.generator
                    .generate(&oracle_view, &region)
                    .map(|embedding| (region, embedding))
            })
            .collect();
        metadata.faces_encoded = encoded.len();

        let embedding = select(encoded, self.selection);
        if embedding.is_none() {
            tracing::warn!(
                faces_detected = metadata.faces_detected,
                "faces detected but none could be encoded"
            );
            metadata = metadata.failed(FailureCode::NoFaceEncoded);
        } else {
            tracing::info!(
                faces_detected = metadata.faces_detected,
                faces_encoded = metadata.faces_encoded,
                "face encoded"
            );
        }

        PipelineOutput {
            embedding,
            metadata,
        }
    }

    /// Encode the live capture and compare it against `enrolled`.
    ///
    /// `enrolled` must have passed boundary validation. `threshold` overrides
    /// the policy's distance threshold for this call only.
    pub fn verify(
        &mut self,
        enrolled: &Embedding,
        bytes: &[u8],
        threshold: Option<f32>,
    ) -> Verification {
        let PipelineOutput {
            embedding,
            metadata,
        } = self.process(bytes);

        let verdict = embedding.map(|captured| {
            let verdict = self
                .policy
                .decide(&EuclideanMatcher, enrolled, &captured, threshold);
            tracing::info!(
                distance = verdict.result.distance,
                confidence = verdict.result.confidence,
                matched = verdict.result.matched,
                accepted = verdict.accepted,
                "face comparison"
            );
            verdict
        });

        Verification { metadata, verdict }
    }
}

fn select(encoded: Vec<(FaceRegion, Embedding)>, strategy: SelectionStrategy) -> Option<Embedding> {
    match strategy {
        SelectionStrategy::FirstFound => encoded.into_iter().next().map(|(_, e)| e),
        SelectionStrategy::HighestScore => {
            let mut best: Option<(f32, Embedding)> = None;
            for (region, embedding) in encoded {
                let score = region.score.unwrap_or(f32::NEG_INFINITY);
                // Strictly greater keeps the earliest face on ties.
                if best.as_ref().map_or(true, |(s, _)| score > *s) {
                    best = Some((score, embedding));
                }
            }
            best.map(|(_, e)| e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::encoder::EncoderError;
    use crate::matcher::RejectReason;
    use crate::types::{ImageShape, EMBEDDING_DIM};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    struct FixedDetector {
        regions: Vec<FaceRegion>,
        fail: bool,
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, _image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
            if self.fail {
                return Err(DetectorError::InferenceFailed("scripted".into()));
            }
            Ok(self.regions.clone())
        }
    }

    /// Encodes a region as a vector whose first element is its `left`
    /// coordinate scaled down; regions narrower than `min_width` fail.
    struct LeftEncoder {
        min_width: u32,
        order: ChannelOrder,
    }

    impl LeftEncoder {
        fn new(min_width: u32) -> Self {
            Self {
                min_width,
                order: ChannelOrder::Rgb,
            }
        }
    }

    impl Encoder for LeftEncoder {
        fn encode(
            &mut self,
            image: &Image,
            region: &FaceRegion,
        ) -> Result<Option<Embedding>, EncoderError> {
            if image.order() != self.order {
                return Err(EncoderError::InferenceFailed("wrong channel order".into()));
            }
            if region.width() < self.min_width {
                return Ok(None);
            }
            let mut values = vec![0.0; EMBEDDING_DIM];
            values[0] = region.left as f32 / 100.0;
            Ok(Some(Embedding::new(values)))
        }

        fn channel_order(&self) -> ChannelOrder {
            self.order
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([90, 120, 200]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn pipeline(regions: Vec<FaceRegion>, min_width: u32) -> FacePipeline<FixedDetector, LeftEncoder> {
        FacePipeline::new(
            FixedDetector {
                regions,
                fail: false,
            },
            LeftEncoder::new(min_width),
        )
    }

    fn reference(left: u32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = left as f32 / 100.0;
        Embedding::new(values)
    }

    #[test]
    fn test_undecodable_bytes() {
        let mut p = pipeline(vec![FaceRegion::new(0, 10, 10, 0)], 0);
        for _ in 0..2 {
            let out = p.process(b"definitely not an image");
            assert!(out.embedding.is_none());
            assert_eq!(out.metadata.error.as_deref(), Some("Invalid image format"));
            assert_eq!(out.metadata.code, Some(FailureCode::InvalidImage));
            assert_eq!(out.metadata.image_shape, None);
        }
    }

    #[test]
    fn test_no_faces_detected() {
        let mut p = pipeline(Vec::new(), 0);
        let out = p.process(&png_bytes(64, 48));
        assert!(out.embedding.is_none());
        assert_eq!(out.metadata.faces_detected, 0);
        assert_eq!(out.metadata.error.as_deref(), Some("No faces detected"));
        assert_eq!(out.metadata.image_shape, Some(ImageShape(48, 64, 3)));
    }

    #[test]
    fn test_detector_failure_reads_as_no_faces() {
        let mut p = FacePipeline::new(
            FixedDetector {
                regions: vec![FaceRegion::new(0, 10, 10, 0)],
                fail: true,
            },
            LeftEncoder::new(0),
        );
        let out = p.process(&png_bytes(32, 32));
        assert_eq!(out.metadata.code, Some(FailureCode::NoFaceDetected));
        assert_eq!(out.metadata.faces_detected, 0);
    }

    #[test]
    fn test_detected_but_not_encoded() {
        let mut p = pipeline(vec![FaceRegion::new(0, 10, 10, 0)], 50);
        let out = p.process(&png_bytes(64, 64));
        assert!(out.embedding.is_none());
        assert_eq!(out.metadata.faces_detected, 1);
        assert_eq!(out.metadata.faces_encoded, 0);
        assert_eq!(out.metadata.code, Some(FailureCode::NoFaceEncoded));
    }

    #[test]
    fn test_first_encoded_face_is_primary() {
        let regions = vec![
            FaceRegion::new(0, 15, 20, 10),  // too narrow, skipped
            FaceRegion::new(0, 60, 30, 30),  // first success
            FaceRegion::new(30, 90, 60, 50), // second success
        ];
        let mut p = pipeline(regions, 20);
        let out = p.process(&png_bytes(100, 100));
        assert_eq!(out.metadata.faces_detected, 3);
        assert_eq!(out.metadata.faces_encoded, 2);
        assert_eq!(out.metadata.error, None);
        assert_eq!(out.embedding, Some(reference(30)));
    }

    #[test]
    fn test_highest_score_selection() {
        let regions = vec![
            FaceRegion::new(0, 40, 30, 10).with_score(0.6),
            FaceRegion::new(0, 90, 30, 60).with_score(0.95),
            FaceRegion::new(40, 90, 70, 50).with_score(0.95),
        ];
        let mut p = pipeline(regions, 0).with_selection(SelectionStrategy::HighestScore);
        let out = p.process(&png_bytes(100, 100));
        assert_eq!(out.embedding, Some(reference(60)));
    }

    #[test]
    fn test_encoder_receives_its_channel_order() {
        let mut encoder = LeftEncoder::new(0);
        encoder.order = ChannelOrder::Bgr;
        let mut p = FacePipeline::new(
            FixedDetector {
                regions: vec![FaceRegion::new(0, 20, 20, 0)],
                fail: false,
            },
            encoder,
        );
        let out = p.process(&png_bytes(32, 32));
        assert!(out.embedding.is_some());
        assert_eq!(out.metadata.faces_encoded, 1);
    }

    #[test]
    fn test_verify_accepts_matching_capture() {
        let mut p = pipeline(vec![FaceRegion::new(0, 60, 30, 30)], 0)
            .with_policy(AcceptancePolicy::new(0.6, 70.0));
        let v = p.verify(&reference(30), &png_bytes(80, 80), None);
        let verdict = v.verdict.unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.result.distance, 0.0);
        assert_eq!(verdict.result.threshold, 0.6);
    }

    #[test]
    fn test_verify_rejects_distant_capture() {
        // captured left=30 vs enrolled left=95 -> distance 0.65
        let mut p = pipeline(vec![FaceRegion::new(0, 60, 30, 30)], 0);
        let v = p.verify(&reference(95), &png_bytes(80, 80), None);
        let verdict = v.verdict.unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, Some(RejectReason::DistanceAboveThreshold));

        let v = p.verify(&reference(95), &png_bytes(80, 80), Some(0.7));
        assert!(v.verdict.unwrap().result.matched);
    }

    #[test]
    fn test_verify_without_face_has_no_verdict() {
        let mut p = pipeline(Vec::new(), 0);
        let v = p.verify(&reference(0), &png_bytes(80, 80), None);
        assert!(v.verdict.is_none());
        assert_eq!(v.metadata.code, Some(FailureCode::NoFaceDetected));
    }
}
