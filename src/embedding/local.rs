//! Local ONNX Runtime embedding provider.
//!
//! all-MiniLM-L6-v2 through `ort`: tokenize with padding to the longest row, run the
//! model once per batch, then mask-weighted mean pooling and L2 normalization.

use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

/// Local ONNX-based embedding provider using all-MiniLM-L6-v2.
pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model_id: String,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
// The Mutex guarantees exclusive access during run().
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Run `cairn model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}. Run `cairn model download` first.",
            tokenizer_path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_id: config.model.clone(),
        })
    }
}

/// Token ids and attention mask for one batch, flattened row-major as `[batch, seq]`.
struct EncodedBatch {
    rows: usize,
    seq_len: usize,
    ids: Vec<i64>,
    mask: Vec<i64>,
}

impl EncodedBatch {
    fn shape(&self) -> Vec<i64> {
        vec![self.rows as i64, self.seq_len as i64]
    }
}

impl LocalEmbeddingProvider {
    fn encode(&self, texts: &[&str]) -> Result<EncodedBatch> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        // BatchLongest padding: every row has the same length.
        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());
        let ids = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&id| i64::from(id)))
            .collect();
        let mask = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&m| i64::from(m)))
            .collect();
        Ok(EncodedBatch {
            rows: encodings.len(),
            seq_len,
            ids,
            mask,
        })
    }
}

/// Attention-masked mean over the token axis, then L2 normalization.
///
/// `hidden` is `[rows, out_seq, dim]` row-major; `mask` is `[rows, mask_seq]`. The model may
/// return fewer positions than were fed in, so the two sequence lengths are kept apart.
fn mean_pool(
    hidden: &[f32],
    rows: usize,
    out_seq: usize,
    dim: usize,
    mask: &[i64],
    mask_seq: usize,
) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|row| {
            let mut pooled = vec![0.0f32; dim];
            let mut weight = 0.0f32;
            for pos in 0..out_seq.min(mask_seq) {
                if mask[row * mask_seq + pos] == 0 {
                    continue;
                }
                let token = &hidden[(row * out_seq + pos) * dim..][..dim];
                for (acc, x) in pooled.iter_mut().zip(token) {
                    *acc += x;
                }
                weight += 1.0;
            }
            if weight > 0.0 {
                pooled.iter_mut().for_each(|x| *x /= weight);
            }
            l2_normalize(&pooled)
        })
        .collect()
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no embedding returned"))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.encode(texts)?;
        let input_ids = Tensor::from_array((batch.shape(), batch.ids.clone().into_boxed_slice()))?;
        let attention_mask =
            Tensor::from_array((batch.shape(), batch.mask.clone().into_boxed_slice()))?;
        // Single-segment input.
        let token_type_ids = Tensor::from_array((
            batch.shape(),
            vec![0i64; batch.rows * batch.seq_len].into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        // Output naming differs between exports.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;

        let dims: &[i64] = &shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );

        Ok(mean_pool(
            data,
            batch.rows,
            dims[1] as usize,
            EMBEDDING_DIM,
            &batch.mask,
            batch.seq_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "local".into(),
            ..Default::default()
        }
    }

    #[test]
    fn mean_pool_ignores_padding() {
        // One row, three positions, two dims; the last position is padding.
        let hidden = [1.0, 0.0, 3.0, 0.0, 100.0, 100.0];
        let pooled = mean_pool(&hidden, 1, 3, 2, &[1, 1, 0], 3);
        assert_eq!(pooled.len(), 1);
        assert!((pooled[0][0] - 1.0).abs() < 1e-6);
        assert!(pooled[0][1].abs() < 1e-6);
    }

    #[test]
    fn missing_model_files_point_at_download_command() {
        let config = EmbeddingConfig {
            provider: "local".into(),
            cache_dir: "/nonexistent/cairn-models".into(),
            ..Default::default()
        };
        let err = LocalEmbeddingProvider::new(&config).err().unwrap();
        assert!(err.to_string().contains("cairn model download"));
    }

    #[test]
    #[ignore] // Requires model files: run with: cargo test -- --ignored
    fn embeds_to_normalized_384_dims() {
        let provider = LocalEmbeddingProvider::new(&model_config()).unwrap();
        let embedding = provider.embed("The boiler was serviced in March").unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "L2 norm should be ~1.0, got {norm}");
    }

    #[test]
    #[ignore]
    fn batch_matches_single_embedding() {
        let provider = LocalEmbeddingProvider::new(&model_config()).unwrap();
        let single = provider.embed("Dentist on Tuesday").unwrap();
        let batch = provider.embed_batch(&["Dentist on Tuesday"]).unwrap();
        let dot: f32 = single.iter().zip(&batch[0]).map(|(a, b)| a * b).sum();
        assert!(dot > 0.999);
    }
}
