//! FaceNet face embedding generator via ONNX Runtime.
//!
//! Converts a cropped, front-facing face into a 128-dimensional embedding.
//! Inference failures never propagate out of [`FaceEmbedder::generate`]:
//! the caller receives a zero embedding, which matches nothing.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
pub const FACENET_INPUT_SIZE: usize = 160;
pub const FACENET_EMBEDDING_DIM: usize = 128;
pub const FACENET_MODEL_FILE: &str = "facenet.onnx";
const FACENET_MODEL_VERSION: &str = "facenet";
const FACENET_PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("model has been released")]
    Closed,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Black-box inference function: NHWC float tensor in, raw embedding out.
pub trait InferenceBackend: Send {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, RecognizerError>;

    /// Identifier stored alongside every embedding this backend produces.
    fn model_version(&self) -> &str;
}

/// ONNX Runtime session for the FaceNet model.
pub struct OrtBackend {
    session: Session,
}

impl OrtBackend {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }
}

impl InferenceBackend for OrtBackend {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, RecognizerError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw_data.to_vec())
    }

    fn model_version(&self) -> &str {
        FACENET_MODEL_VERSION
    }
}

/// Embedding generator that owns its inference backend.
///
/// Construct once at startup and hand it to whoever runs inference; call
/// [`close`](Self::close) (or drop it) to release the model.
pub struct FaceEmbedder<B: InferenceBackend = OrtBackend> {
    backend: Option<B>,
    dim: usize,
}

impl FaceEmbedder<OrtBackend> {
    /// Load `facenet.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, RecognizerError> {
        let path = model_dir.join(FACENET_MODEL_FILE);
        let backend = OrtBackend::load(&path.to_string_lossy())?;
        Ok(Self::new(backend))
    }
}

impl<B: InferenceBackend> FaceEmbedder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Some(backend),
            dim: FACENET_EMBEDDING_DIM,
        }
    }

    /// Expected output dimension (128 unless overridden).
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Generate an embedding for a face crop.
    ///
    /// Never fails: on any inference error a zero embedding of the model's
    /// dimension is returned and the error is logged.
    pub fn generate(&mut self, face: &RgbImage) -> Embedding {
        match self.try_generate(face) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(error = %e, "face embedding failed; substituting zero embedding");
                Embedding::zeroed(self.dim)
            }
        }
    }

    /// Like [`generate`](Self::generate) but surfaces the failure.
    pub fn try_generate(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let backend = self.backend.as_mut().ok_or(RecognizerError::Closed)?;

        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::InferenceFailed("empty face crop".into()));
        }

        let input = Self::preprocess(face);
        let raw = backend.infer(&input)?;

        if raw.len() != self.dim {
            return Err(RecognizerError::DimensionMismatch {
                expected: self.dim,
                actual: raw.len(),
            });
        }

        // L2-normalize the embedding
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 && norm.is_finite() {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_version: Some(backend.model_version().to_string()),
        })
    }

    /// Release the model. Later calls to `generate` yield zero embeddings.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            tracing::info!("face embedding model released");
        }
    }

    /// Resize to 160x160 (bilinear) and pack into a NHWC float tensor in [0, 1].
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE;
        let resized;
        let src = if face.width() as usize == size && face.height() as usize == size {
            face
        } else {
            resized = image::imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in src.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, y, x, c]] = pixel[c] as f32 / FACENET_PIXEL_SCALE;
            }
        }

        tensor
    }
}
