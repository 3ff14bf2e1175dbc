//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait and two implementations: an ONNX
//! all-MiniLM-L6-v2 model ([`local`]) and a deterministic feature-hashing provider
//! ([`hashed`]) that needs no model download. Both produce L2-normalized vectors of
//! [`EMBEDDING_DIM`] dimensions. The provider is created via [`create_provider`].

pub mod hashed;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::error::CairnError;

/// Number of dimensions in the embedding vectors.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// All methods are synchronous: callers in async contexts go through
/// [`embed_with_timeout`].
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Identifier recorded in `schema_meta` so a model swap can be detected.
    fn model_id(&self) -> &str;

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// `"local"` needs the ONNX model files (`cairn model download`); `"hashed"` works offline.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        "hashed" => Ok(Box::new(hashed::HashedEmbeddingProvider::new())),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashed"),
    }
}

/// Embed on the blocking pool, bounded by `timeout`.
///
/// A timeout surfaces as [`CairnError::Timeout`]; the blocking work is abandoned.
pub async fn embed_with_timeout(
    provider: Arc<dyn EmbeddingProvider>,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let text = text.to_string();
    let task = tokio::task::spawn_blocking(move || provider.embed(&text));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| anyhow::anyhow!("embedding task failed: {e}"))?,
        Err(_) => Err(CairnError::Timeout {
            step: "embedding".into(),
            after: timeout,
        }
        .into()),
    }
}

/// False for the zero vector (and anything non-finite), which has no meaningful cosine
/// similarity to anything.
pub fn has_direction(v: &[f32]) -> bool {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    norm_sq.is_finite() && norm_sq > 0.0
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProvider;

    impl EmbeddingProvider for SlowProvider {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![0.0; EMBEDDING_DIM])
        }

        fn model_id(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_has_no_direction() {
        assert!(!has_direction(&[0.0, 0.0]));
        assert!(!has_direction(&[f32::NAN, 1.0]));
        assert!(has_direction(&l2_normalize(&[3.0, 4.0])));
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = crate::config::EmbeddingConfig {
            provider: "remote".into(),
            ..Default::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[tokio::test]
    async fn embedding_timeout_is_a_typed_failure() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(SlowProvider);
        let err = embed_with_timeout(provider, "hello", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CairnError>(),
            Some(CairnError::Timeout { .. })
        ));
    }
}
