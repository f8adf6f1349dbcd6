//! Face embedding generation.
//!
//! [`Encoder`] is the embedding oracle seam. [`EmbeddingGenerator`] wraps an
//! oracle so that a face which cannot be encoded is simply absent from the
//! result. [`OnnxEncoder`] runs a 128-d embedding network via ONNX Runtime.

use crate::alignment;
use crate::types::{ChannelOrder, Embedding, FaceRegion, Image, EMBEDDING_DIM};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_DEFAULT_INPUT_SIZE: u32 = 160;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;
/// Regions narrower or shorter than this are not worth encoding.
const ENCODER_MIN_FACE_SIZE: u32 = 20;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding oracle: turns one face of a whole image into an [`Embedding`].
///
/// `Ok(None)` means the oracle produced nothing for this region (too small,
/// too blurry, ...), which is a normal outcome.
pub trait Encoder: Send {
    fn encode(
        &mut self,
        image: &Image,
        region: &FaceRegion,
    ) -> Result<Option<Embedding>, EncoderError>;

    /// Channel order the oracle expects its input in.
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }
}

/// Runs an [`Encoder`], logging and discarding anything that is not a valid
/// 128-d embedding.
pub struct EmbeddingGenerator<E> {
    encoder: E,
}

impl<E: Encoder> EmbeddingGenerator<E> {
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    /// Order the caller must convert images to before [`generate`](Self::generate).
    pub fn channel_order(&self) -> ChannelOrder {
        self.encoder.channel_order()
    }

    /// `image` must already be in [`channel_order`](Self::channel_order).
    pub fn generate(&mut self, image: &Image, region: &FaceRegion) -> Option<Embedding> {
        debug_assert_eq!(image.order(), self.encoder.channel_order());

        match self.encoder.encode(image, region) {
            Ok(Some(embedding)) => match embedding.validate() {
                Ok(()) => Some(embedding),
                Err(e) => {
                    tracing::warn!(error = %e, ?region, "encoder returned unusable embedding");
                    None
                }
            },
            Ok(None) => {
                tracing::debug!(?region, "no encoding generated for face");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, ?region, "face encoding failed");
                None
            }
        }
    }
}

/// ONNX face embedding network producing 128-d vectors.
pub struct OnnxEncoder {
    session: Session,
    input_size: u32,
    order: ChannelOrder,
}

impl OnnxEncoder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size: ENCODER_DEFAULT_INPUT_SIZE,
            order: ChannelOrder::Rgb,
        })
    }

    /// Square input resolution of the network (default 160).
    pub fn with_input_size(mut self, size: u32) -> Self {
        self.input_size = size.max(1);
        self
    }

    /// Channel order the network was trained on (default RGB).
    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    /// Resize a face crop to `size`×`size` and normalize it into a NCHW tensor.
    fn preprocess(face: &Image, size: u32) -> Option<Array4<f32>> {
        let src = RgbImage::from_raw(face.width(), face.height(), face.as_bytes().to_vec())?;
        let resized = image::imageops::resize(&src, size, size, FilterType::Triangle);

        let n = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
            }
        }
        Some(tensor)
    }
}

impl Encoder for OnnxEncoder {
    fn encode(
        &mut self,
        image: &Image,
        region: &FaceRegion,
    ) -> Result<Option<Embedding>, EncoderError> {
        if region.width() < ENCODER_MIN_FACE_SIZE || region.height() < ENCODER_MIN_FACE_SIZE {
            return Ok(None);
        }

        let Some(face) = alignment::extract_region(image, region) else {
            return Ok(None);
        };
        let input = Self::preprocess(&face, self.input_size)
            .ok_or_else(|| EncoderError::InferenceFailed("face crop buffer size mismatch".into()))?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Some(Embedding::new(l2_normalize(raw_data))))
    }

    fn channel_order(&self) -> ChannelOrder {
        self.order
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
