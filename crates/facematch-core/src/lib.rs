//! Face verification pipeline.
//!
//! Locates faces, reduces each to a 128-dimensional embedding, and decides
//! whether a live capture matches an enrolled embedding. Detection and
//! embedding are delegated to pluggable oracles ([`Detector`], [`Encoder`]);
//! ONNX-backed implementations are provided.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod matcher;
pub mod pipeline;
pub mod types;

pub use config::{default_model_dir, Config};
pub use detector::{DetectionMode, Detector, FaceLocalizer, ScrfdDetector};
pub use encoder::{EmbeddingGenerator, Encoder, OnnxEncoder};
pub use matcher::{AcceptancePolicy, EuclideanMatcher, Matcher, RejectReason, Verdict};
pub use pipeline::{FacePipeline, PipelineOutput, SelectionStrategy, Verification};
pub use types::{
    ChannelOrder, Embedding, EmbeddingError, FaceRegion, FailureCode, Image, ImageShape, MatchResult,
    ProcessingMetadata, EMBEDDING_DIM,
};
