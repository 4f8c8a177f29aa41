//! Embedding generation for vector search

use crate::error::{Error, Result};

/// Text to fixed-length vector.
///
/// Implementations must return L2-normalized vectors of exactly
/// `dimension()` entries so that inner product equals cosine similarity.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a search query
    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query)
    }

    /// Embed stored card text
    fn embed_document(&self, document: &str) -> Result<Vec<f32>> {
        self.embed(document)
    }
}

/// Deterministic signed feature hashing over words and word bigrams
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::Config(
                "embedding dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Scale to unit length in place; zero vectors stay zero
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(PRIME))
}

#[cfg(feature = "fastembed-embeddings")]
pub use neural::FastEmbedder;

#[cfg(feature = "fastembed-embeddings")]
mod neural {
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tracing::info;

    use super::{l2_normalize, Embedder};
    use crate::error::{Error, Result};

    /// Multilingual sentence embeddings via fastembed
    pub struct FastEmbedder {
        model: TextEmbedding,
        dimension: usize,
    }

    impl FastEmbedder {
        pub fn new() -> Result<Self> {
            Self::with_model(EmbeddingModel::MultilingualE5Small)
        }

        pub fn with_model(model_name: EmbeddingModel) -> Result<Self> {
            info!("Initializing embedding model: {:?}", model_name);

            let dimension = match model_name {
                EmbeddingModel::MultilingualE5Small => 384,
                EmbeddingModel::MultilingualE5Base => 768,
                EmbeddingModel::MultilingualE5Large => 1024,
                EmbeddingModel::AllMiniLML6V2 => 384,
                EmbeddingModel::BGESmallENV15 => 384,
                EmbeddingModel::BGEBaseENV15 => 768,
                _ => 384,
            };

            let mut options = InitOptions::default();
            options.model_name = model_name;
            options.show_download_progress = true;

            let model = TextEmbedding::try_new(options)
                .map_err(|e| Error::Embedding(format!("Failed to initialize model: {e}")))?;

            Ok(Self { model, dimension })
        }
    }

    impl Embedder for FastEmbedder {
        fn name(&self) -> &str {
            "fastembed"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let embeddings = self
                .model
                .embed(vec![text], None)
                .map_err(|e| Error::Embedding(format!("Failed to generate embedding: {e}")))?;

            let mut vector = embeddings
                .into_iter()
                .next()
                .ok_or_else(|| Error::Embedding("No embedding generated".to_string()))?;

            l2_normalize(&mut vector);
            Ok(vector)
        }

        // E5 models are trained with these role prefixes
        fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
            self.embed(&format!("query: {}", query))
        }

        fn embed_document(&self, document: &str) -> Result<Vec<f32>> {
            self.embed(&format!("passage: {}", document))
        }
    }
}
