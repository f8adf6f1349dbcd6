//! Face localization.
//!
//! [`Detector`] is the detection oracle seam; [`FaceLocalizer`] wraps any
//! oracle with the pipeline's fail-open policy. [`ScrfdDetector`] is the
//! bundled ONNX backend: SCRFD with 3-stride anchor-free decoding and
//! NMS post-processing.

use crate::types::{ChannelOrder, FaceRegion, Image};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const SCRFD_FAST_INPUT_SIZE: usize = 320;
const SCRFD_ACCURATE_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection oracle: finds face rectangles in a whole image.
pub trait Detector: Send {
    fn detect(&mut self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError>;

    /// Channel order the oracle expects its input in.
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }
}

/// Accuracy/speed trade-off of the detection oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Approximate, low-resolution pass (HOG-class speed).
    #[default]
    Fast,
    /// Slower full-resolution pass (CNN-class accuracy).
    Accurate,
}

impl DetectionMode {
    /// Square letterbox size the SCRFD backend runs at.
    pub fn input_size(&self) -> usize {
        match self {
            DetectionMode::Fast => SCRFD_FAST_INPUT_SIZE,
            DetectionMode::Accurate => SCRFD_ACCURATE_INPUT_SIZE,
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Fast => f.write_str("fast"),
            DetectionMode::Accurate => f.write_str("accurate"),
        }
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectionMode::Fast),
            "accurate" | "cnn" => Ok(DetectionMode::Accurate),
            other => Err(format!("unknown detection mode: {other}")),
        }
    }
}

/// Runs a [`Detector`] and never fails: oracle errors become an empty result.
///
/// "No face" and "detector crashed" are deliberately indistinguishable to the
/// caller; the failure only shows up in the logs.
pub struct FaceLocalizer<D> {
    detector: D,
}

impl<D: Detector> FaceLocalizer<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    pub fn locate(&mut self, image: &Image) -> Vec<FaceRegion> {
        let input = image.to_order(self.detector.channel_order());
        let regions = match self.detector.detect(&input) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::error!(error = %e, "face detection failed; reporting no faces");
                return Vec::new();
            }
        };

        let total = regions.len();
        let valid: Vec<FaceRegion> = regions
            .into_iter()
            .filter(|r| {
                let ok = r.fits(image.width(), image.height());
                if !ok {
                    tracing::warn!(region = ?r, "detector returned region outside image; dropped");
                }
                ok
            })
            .collect();

        tracing::debug!(detected = total, kept = valid.len(), "faces located");
        valid
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded detection in original image coordinates, before clamping.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(
        model_path: &str,
        mode: DetectionMode,
        intra_threads: usize,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            %mode,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: mode.input_size(),
            stride_indices,
        })
    }

    /// Convert an RGB image into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, image: &Image) -> Result<(Array4<f32>, LetterboxInfo), DetectorError> {
        let size = self.input_size;
        let width = image.width() as usize;
        let height = image.height() as usize;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let src = RgbImage::from_raw(image.width(), image.height(), image.as_bytes().to_vec())
            .ok_or_else(|| DetectorError::InferenceFailed("image buffer size mismatch".into()))?;
        let resized =
            image::imageops::resize(&src, new_w as u32, new_h as u32, FilterType::Triangle);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        // Padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..new_h {
            for x in 0..new_w {
                let px = resized.get_pixel(x as u32, y as u32).0;
                for c in 0..3 {
                    tensor[[0, c, y + pad_y_start, x + pad_x_start]] =
                        (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        Ok((tensor, LetterboxInfo { scale, pad_x, pad_y }))
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, letterbox) = self.preprocess(image)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(into_regions(
            nms(candidates, SCRFD_NMS_THRESHOLD),
            image.width(),
            image.height(),
        ))
    }
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped to stride slots;
/// anything else falls back to the standard positional ordering
/// [0-2] = scores, [3-5] = bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * s;
        let anchor_cy = (anchor_idx / grid) as f32 * s;

        // Offsets are distances from the anchor to each box edge, in strides.
        let x1 = anchor_cx - bboxes[bbox_off] * s;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * s;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * s;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * s;

        detections.push(Candidate {
            x1: (x1 - letterbox.pad_x) / letterbox.scale,
            y1: (y1 - letterbox.pad_y) / letterbox.scale,
            x2: (x2 - letterbox.pad_x) / letterbox.scale,
            y2: (y2 - letterbox.pad_y) / letterbox.scale,
            score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Clamp candidates to the image and order them top-to-bottom, left-to-right.
fn into_regions(candidates: Vec<Candidate>, width: u32, height: u32) -> Vec<FaceRegion> {
    let mut regions: Vec<FaceRegion> = candidates
        .into_iter()
        .filter_map(|c| {
            FaceRegion::from_corners(c.x1, c.y1, c.x2, c.y2, width, height)
                .map(|r| r.with_score(c.score))
        })
        .collect();
    regions.sort_by_key(|r| (r.top, r.left));
    regions
}
