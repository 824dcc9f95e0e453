//! rollcall-core — Face embedding and gallery matching.
//!
//! Turns a cropped face into a FaceNet embedding via ONNX Runtime and
//! compares it against a gallery of registered students by cosine similarity.

pub mod matcher;
pub mod recognizer;
pub mod types;

pub use matcher::{CosineMatcher, Matcher, DEFAULT_SIMILARITY_THRESHOLD};
pub use recognizer::{FaceEmbedder, InferenceBackend, OrtBackend, RecognizerError};
pub use types::{Embedding, GalleryEntry, MatchResult};
