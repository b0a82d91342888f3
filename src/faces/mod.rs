pub mod clustering;
pub mod detector;
pub mod distance;
pub mod index;
pub mod provider;

pub use clustering::{ClusterAssigner, ClusterSession};
pub use detector::OnnxFaceProvider;
pub use distance::euclidean_distance;
pub use index::{FaceMatch, SimilarityIndex, SimilarityMatches};
pub use provider::{detect_offloaded, EmbeddingProvider, FaceObservation, QueryFaceSelection};
