//! Feature-hashing embedding provider.
//!
//! Maps each lowercase word to a signed bucket of a 384-dim vector and L2-normalizes
//! the sum. Texts that share words land close together; texts with no words in common
//! are near-orthogonal. Deterministic across runs and platforms.

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

#[derive(Debug, Default, Clone)]
pub struct HashedEmbeddingProvider;

impl HashedEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 1)
        {
            let hash = fnv1a(word.to_lowercase().as_bytes());
            let bucket = (hash % EMBEDDING_DIM as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        Ok(l2_normalize(&v))
    }

    fn model_id(&self) -> &str {
        "hashed-384"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn produces_normalized_fixed_dim_vectors() {
        let emb = HashedEmbeddingProvider::new().embed("Rust is fast").unwrap();
        assert_eq!(emb.len(), EMBEDDING_DIM);
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn deterministic_and_case_insensitive() {
        let p = HashedEmbeddingProvider::new();
        assert_eq!(p.embed("Garden Hose").unwrap(), p.embed("garden hose").unwrap());
    }

    #[test]
    fn shared_words_score_higher_than_disjoint_text() {
        let p = HashedEmbeddingProvider::new();
        let a = p.embed("the dentist appointment is on tuesday").unwrap();
        let b = p.embed("when is the dentist appointment").unwrap();
        let c = p.embed("quantum chromodynamics lecture notes").unwrap();
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let emb = HashedEmbeddingProvider::new().embed("").unwrap();
        assert!(emb.iter().all(|x| *x == 0.0));
    }
}
