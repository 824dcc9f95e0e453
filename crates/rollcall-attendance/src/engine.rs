//! Embedding engine thread and the check-in pipeline.
//!
//! The inference runtime is not assumed safe for concurrent calls, so one
//! dedicated OS thread owns the [`FaceEmbedder`] and serves requests in
//! order. Async callers hold a cloneable [`EmbedderHandle`].

use crate::reconciler::{AttendanceError, Reconciler};
use crate::record::AttendanceRecord;
use crate::store::{GalleryStore, StoreError};
use image::RgbImage;
use rollcall_core::{Embedding, FaceEmbedder, GalleryEntry, InferenceBackend, MatchResult, Matcher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("attendance: {0}")]
    Attendance(#[from] AttendanceError),
    #[error("gallery: {0}")]
    Gallery(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no usable face embedding among {0} captures")]
    NoUsableCapture(usize),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Embed {
        face: RgbImage,
        reply: oneshot::Sender<Embedding>,
    },
}

/// Clone-safe handle to the engine thread. The thread, and the model it
/// owns, lives until the last handle is dropped.
#[derive(Clone)]
pub struct EmbedderHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EmbedderHandle {
    /// Embed one face crop. Inference failures come back as a zero embedding.
    pub async fn generate(&self, face: RgbImage) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed {
                face,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Move `embedder` onto a dedicated thread and return a handle to it.
pub fn spawn_embedder<B>(mut embedder: FaceEmbedder<B>) -> Result<EmbedderHandle, EngineError>
where
    B: InferenceBackend + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-embedder".into())
        .spawn(move || {
            tracing::info!("embedder thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { face, reply } => {
                        let embedding = embedder.generate(&face);
                        let _ = reply.send(embedding);
                    }
                }
            }
            embedder.close();
            tracing::info!("embedder thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EmbedderHandle { tx })
}

/// Result of a check-in attempt that did not error.
#[derive(Debug, Clone)]
pub enum CheckInOutcome {
    Marked {
        record: AttendanceRecord,
        matched: MatchResult,
    },
    /// Nobody cleared the threshold. `best_similarity` is the closest
    /// student's score, absent for an empty gallery or failed inference.
    NoMatch { best_similarity: Option<f32> },
}

/// Face capture → embedding → gallery match → attendance mark.
pub struct CheckIn {
    embedder: EmbedderHandle,
    gallery: Arc<dyn GalleryStore>,
    matcher: Box<dyn Matcher + Send + Sync>,
    reconciler: Arc<Reconciler>,
    threshold: f32,
}

impl CheckIn {
    pub fn new(
        embedder: EmbedderHandle,
        gallery: Arc<dyn GalleryStore>,
        matcher: Box<dyn Matcher + Send + Sync>,
        reconciler: Arc<Reconciler>,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            gallery,
            matcher,
            reconciler,
            threshold,
        }
    }

    /// Identify the face and mark that student present in `class_id`.
    pub async fn run(&self, face: RgbImage, class_id: &str) -> Result<CheckInOutcome, EngineError> {
        let probe = self.embedder.generate(face).await?;
        let gallery = self.gallery.load_gallery().await?;

        let Some(matched) = self.matcher.find_best_match(&probe, &gallery, self.threshold) else {
            let best_similarity = if probe.is_degenerate() {
                None
            } else {
                self.matcher.best_candidate(&probe, &gallery).map(|(_, sim)| sim)
            };
            tracing::info!(
                class_id,
                gallery_size = gallery.len(),
                best_similarity,
                threshold = self.threshold,
                "no gallery match"
            );
            return Ok(CheckInOutcome::NoMatch { best_similarity });
        };

        tracing::debug!(
            student_id = %matched.student_id,
            similarity = matched.similarity,
            "gallery match"
        );
        let record = self
            .reconciler
            .mark_attendance(&matched.student_id, class_id, matched.similarity)
            .await?;
        Ok(CheckInOutcome::Marked { record, matched })
    }

    /// Register one gallery entry per usable capture of `student_id`.
    ///
    /// Captures whose inference failed are skipped; if none are usable
    /// nothing is registered.
    pub async fn enroll(
        &self,
        student_id: &str,
        faces: Vec<RgbImage>,
    ) -> Result<Vec<GalleryEntry>, EngineError> {
        let captures = faces.len();
        let mut embeddings = Vec::with_capacity(captures);
        for face in faces {
            let embedding = self.embedder.generate(face).await?;
            if embedding.is_degenerate() {
                tracing::warn!(student_id, "skipping capture with failed inference");
                continue;
            }
            embeddings.push(embedding);
        }

        if embeddings.is_empty() {
            return Err(EngineError::NoUsableCapture(captures));
        }

        let mut entries = Vec::with_capacity(embeddings.len());
        for embedding in &embeddings {
            entries.push(self.gallery.register_embedding(student_id, embedding).await?);
        }
        tracing::info!(student_id, entries = entries.len(), captures, "student enrolled");
        Ok(entries)
    }
}
