use crate::engine::{EngineError, EngineHandle};
use crate::request::{self, RequestError};
use crate::response::{EncodeResponse, EnrollResponse, MatchResponse};
use facematch_core::{Config, DetectionMode, SelectionStrategy};
use thiserror::Error;
use zbus::interface;

pub const BUS_NAME: &str = "org.facematch.Verifier1";
pub const OBJECT_PATH: &str = "/org/facematch/Verifier1";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to serialize response: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Request(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

/// Settings reported by `Status`.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub detection_mode: DetectionMode,
    pub distance_threshold: f32,
    pub min_confidence: f32,
    pub selection: SelectionStrategy,
}

impl ServiceInfo {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detection_mode: config.detection_mode,
            distance_threshold: config.distance_threshold,
            min_confidence: config.min_confidence,
            selection: config.selection,
        }
    }
}

/// D-Bus interface for the face-match daemon.
///
/// Bus name: org.facematch.Verifier1
/// Object path: /org/facematch/Verifier1
///
/// Every method takes and returns a JSON document.
pub struct FaceMatchService {
    engine: EngineHandle,
    info: ServiceInfo,
}

impl FaceMatchService {
    pub fn new(engine: EngineHandle, info: ServiceInfo) -> Self {
        Self { engine, info }
    }

    async fn handle_encode(&self, body: &str) -> Result<String, ServiceError> {
        let image = request::parse_encode(body)?;
        let output = self.engine.encode(image).await?;
        Ok(serde_json::to_string(&EncodeResponse::from(output))?)
    }

    async fn handle_enroll(&self, body: &str) -> Result<String, ServiceError> {
        let req = request::parse_enroll(body)?;
        tracing::info!(identity = %req.identity, "enroll requested");
        let output = self.engine.encode(req.image).await?;
        let response = EnrollResponse::new(req.identity, output, chrono::Utc::now());
        if response.success {
            tracing::info!(identity = %response.identity, "face enrolled");
        }
        Ok(serde_json::to_string(&response)?)
    }

    async fn handle_match(&self, body: &str) -> Result<String, ServiceError> {
        let req = request::parse_match(body)?;
        let verification = self
            .engine
            .verify(req.enrolled, req.image, req.threshold)
            .await?;
        let response = MatchResponse::from(verification);
        tracing::info!(
            success = response.success,
            matched = response.matched,
            confidence = response.confidence,
            "match completed"
        );
        Ok(serde_json::to_string(&response)?)
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "workers": self.engine.workers(),
            "detection_mode": self.info.detection_mode.to_string(),
            "distance_threshold": self.info.distance_threshold,
            "min_confidence": self.info.min_confidence,
            "selection": self.info.selection.to_string(),
        })
    }
}

fn log_failure<T>(method: &str, result: Result<T, ServiceError>) -> zbus::fdo::Result<T> {
    result.map_err(|e| {
        tracing::warn!(method, error = %e, "request failed");
        e.into()
    })
}

#[interface(name = "org.facematch.Verifier1")]
impl FaceMatchService {
    /// Detect and encode one face: `{"image": "<base64>"}`.
    async fn encode(&self, request: &str) -> zbus::fdo::Result<String> {
        log_failure("Encode", self.handle_encode(request).await)
    }

    /// Encode a face for enrolment: `{"image": "<base64>", "identity": <any>}`.
    async fn enroll(&self, request: &str) -> zbus::fdo::Result<String> {
        log_failure("Enroll", self.handle_enroll(request).await)
    }

    /// Verify a live capture against an enrolled embedding.
    async fn match_face(&self, request: &str) -> zbus::fdo::Result<String> {
        log_failure("MatchFace", self.handle_match(request).await)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }
}
