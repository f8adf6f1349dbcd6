use facematch_core::detector::DetectorError;
use facematch_core::encoder::EncoderError;
use facematch_core::{Detector, Embedding, Encoder, FacePipeline, PipelineOutput, Verification};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("request abandoned after {0:?}")]
    Timeout(Duration),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the worker threads.
enum EngineRequest {
    Encode {
        image: Vec<u8>,
        reply: oneshot::Sender<PipelineOutput>,
    },
    Verify {
        enrolled: Embedding,
        image: Vec<u8>,
        threshold: Option<f32>,
        reply: oneshot::Sender<Verification>,
    },
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<EngineRequest>>>;

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    workers: usize,
}

impl EngineHandle {
    /// Run the pipeline on one image.
    pub async fn encode(&self, image: Vec<u8>) -> Result<PipelineOutput, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::Encode { image, reply }, reply_rx)
            .await
    }

    /// Encode a live capture and decide whether it matches `enrolled`.
    pub async fn verify(
        &self,
        enrolled: Embedding,
        image: Vec<u8>,
        threshold: Option<f32>,
    ) -> Result<Verification, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(
            EngineRequest::Verify {
                enrolled,
                image,
                threshold,
                reply,
            },
            reply_rx,
        )
        .await
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a request and wait for its reply under the caller deadline.
    ///
    /// On expiry the request is abandoned, not interrupted: a worker that
    /// already started it runs to completion and its reply is dropped.
    async fn submit<T>(
        &self,
        request: EngineRequest,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Spawn `workers` pipeline threads sharing one bounded request queue.
///
/// Every pipeline is built up front on the calling thread, so a missing
/// model fails startup instead of the first request.
pub fn spawn_engine<D, E, F>(
    workers: usize,
    queue_depth: usize,
    timeout: Duration,
    mut factory: F,
) -> Result<EngineHandle, EngineError>
where
    D: Detector + 'static,
    E: Encoder + 'static,
    F: FnMut(usize) -> Result<FacePipeline<D, E>, EngineError>,
{
    let workers = workers.max(1);
    let pipelines = (0..workers)
        .map(&mut factory)
        .collect::<Result<Vec<_>, _>>()?;

    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let queue: SharedQueue = Arc::new(Mutex::new(rx));

    for (id, pipeline) in pipelines.into_iter().enumerate() {
        let queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name(format!("facematch-worker-{id}"))
            .spawn(move || run_worker(id, pipeline, queue))?;
    }

    tracing::info!(workers, queue_depth, ?timeout, "engine started");

    Ok(EngineHandle {
        tx,
        timeout,
        workers,
    })
}

fn run_worker<D: Detector, E: Encoder>(id: usize, mut pipeline: FacePipeline<D, E>, queue: SharedQueue) {
    tracing::info!(worker = id, "worker thread started");
    loop {
        // Only one idle worker waits on the queue at a time; the lock is
        // released before the request is processed.
        let next = {
            let mut rx = match queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rx.blocking_recv()
        };
        let Some(request) = next else { break };

        match request {
            EngineRequest::Encode { image, reply } => {
                if reply.is_closed() {
                    tracing::debug!(worker = id, "skipping abandoned encode request");
                    continue;
                }
                let output = pipeline.process(&image);
                if reply.send(output).is_err() {
                    tracing::debug!(worker = id, "caller abandoned encode request");
                }
            }
            EngineRequest::Verify {
                enrolled,
                image,
                threshold,
                reply,
            } => {
                if reply.is_closed() {
                    tracing::debug!(worker = id, "skipping abandoned verify request");
                    continue;
                }
                let verification = pipeline.verify(&enrolled, &image, threshold);
                if reply.send(verification).is_err() {
                    tracing::debug!(worker = id, "caller abandoned verify request");
                }
            }
        }
    }
    tracing::info!(worker = id, "worker thread exiting");
}
