//! Vector utilities: BLOB codec, validation and cosine similarity.
//!
//! Embeddings are produced outside docgraph and handed in as plain
//! `Vec<f32>`. Everything here is pure.

use crate::error::{GraphError, Result};

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use docgraph_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing bytes that do not
/// form a whole `f32` are ignored; callers that care compare lengths.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Reject vectors that cannot take part in cosine ranking.
pub fn validate_vector(model_id: &str, vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(GraphError::InvalidArgument(format!(
            "empty vector for model '{}'",
            model_id
        )));
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(GraphError::InvalidArgument(format!(
            "non-finite value at position {} in vector for model '{}'",
            pos, model_id
        )));
    }
    Ok(())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
