use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::str::FromStr;
use thiserror::Error;

/// Fixed length of every face embedding.
pub const EMBEDDING_DIM: usize = 128;

/// Interleaved channel order of an [`Image`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "bgr" => Ok(ChannelOrder::Bgr),
            other => Err(format!("unknown channel order: {other}")),
        }
    }
}

/// Image dimensions as `(height, width, channels)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape(pub u32, pub u32, pub u32);

/// A decoded 3-channel, 8-bit image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    order: ChannelOrder,
    data: Vec<u8>,
}

impl Image {
    pub const CHANNELS: usize = 3;

    /// Wrap a raw interleaved buffer. Returns `None` when the buffer length
    /// does not match the dimensions or either dimension is zero.
    pub fn from_raw(width: u32, height: u32, order: ChannelOrder, data: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            order,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape(self.height, self.width, Self::CHANNELS as u32)
    }

    /// Pixel at `(x, y)` in this image's channel order, or `None` outside
    /// the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// View this image in `order`, swapping the first and last channel only
    /// when the orders differ.
    pub fn to_order(&self, order: ChannelOrder) -> Cow<'_, Image> {
        if self.order == order {
            return Cow::Borrowed(self);
        }
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(Self::CHANNELS) {
            px.swap(0, 2);
        }
        Cow::Owned(Image {
            width: self.width,
            height: self.height,
            order,
            data,
        })
    }

    /// Copy the half-open rectangle `[top, bottom) × [left, right)`.
    ///
    /// `None` when the rectangle is empty or leaves the image.
    pub fn crop(&self, top: u32, left: u32, bottom: u32, right: u32) -> Option<Image> {
        if top >= bottom || left >= right || bottom > self.height || right > self.width {
            return None;
        }
        let out_w = right - left;
        let out_h = bottom - top;
        let row_bytes = out_w as usize * Self::CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * out_h as usize);
        for y in top..bottom {
            let start = (y as usize * self.width as usize + left as usize) * Self::CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Some(Image {
            width: out_w,
            height: out_h,
            order: self.order,
            data,
        })
    }
}

/// Axis-aligned face rectangle in pixel coordinates of one image.
///
/// `bottom` and `right` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    /// Detector score, when the oracle reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl FaceRegion {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
            score: None,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// `0 <= top < bottom <= height` and `0 <= left < right <= width`.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.top < self.bottom
            && self.bottom <= height
            && self.left < self.right
            && self.right <= width
    }

    /// Build a region from float corners, clamped to an image of the given
    /// size. Returns `None` if nothing of the box lies inside the image.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<Self> {
        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            return None;
        }
        let left = x1.floor().clamp(0.0, width as f32) as u32;
        let top = y1.floor().clamp(0.0, height as f32) as u32;
        let right = x2.ceil().clamp(0.0, width as f32) as u32;
        let bottom = y2.ceil().clamp(0.0, height as f32) as u32;
        let region = Self::new(top, right, bottom, left);
        region.fits(width, height).then_some(region)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {expected}-dim embedding, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("embedding value at index {0} is not finite")]
    NonFinite(usize),
}

/// 128-dimensional face signature.
///
/// Serialized as a bare JSON number array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Wrap values without checking them. Use [`validate`](Self::validate)
    /// before trusting caller-supplied data.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.0
    }

    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.0.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension {
                expected: EMBEDDING_DIM,
                actual: self.0.len(),
            });
        }
        match self.0.iter().position(|v| !v.is_finite()) {
            Some(idx) => Err(EmbeddingError::NonFinite(idx)),
            None => Ok(()),
        }
    }

    /// L2 norm of the element-wise difference. Only meaningful for equal
    /// lengths; extra elements of the longer vector are ignored.
    ///
    /// Accumulated in f64 so large finite inputs stay finite; the result
    /// saturates at `f32::MAX`. Non-finite inputs still yield NaN or inf.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        let distance = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
            .sum::<f64>()
            .sqrt();
        if distance.is_finite() {
            distance.min(f32::MAX as f64) as f32
        } else {
            distance as f32
        }
    }
}

/// Outcome of comparing two embeddings under a distance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub distance: f32,
    /// Calibrated confidence percentage in [0, 100].
    pub confidence: f32,
    pub threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Machine-readable failure kind of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    InvalidImage,
    NoFaceDetected,
    NoFaceEncoded,
}

impl FailureCode {
    pub fn message(&self) -> &'static str {
        match self {
            FailureCode::InvalidImage => "Invalid image format",
            FailureCode::NoFaceDetected => "No faces detected",
            FailureCode::NoFaceEncoded => "No faces could be encoded",
        }
    }
}

/// What happened during one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub faces_detected: usize,
    pub faces_encoded: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_shape: Option<ImageShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FailureCode>,
}

impl ProcessingMetadata {
    pub fn failed(mut self, code: FailureCode) -> Self {
        self.error = Some(code.message().to_string());
        self.code = Some(code);
        self
    }
}
