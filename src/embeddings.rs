use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// Turns text into vectors.
///
/// Implementations must be deterministic for a given model and input. The
/// same model has to be used to build an index and to query it; nothing
/// checks this beyond the recorded model name.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, recorded with the stored index
    fn model(&self) -> &str;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed several texts, preserving their order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lengths;

    #[async_trait]
    impl Embedder for Lengths {
        fn model(&self) -> &str {
            "lengths"
        }

        async fn embed(&self, text: &str) -> Result<Embedding> {
            Ok(Embedding::new(vec![text.len() as f32]))
        }
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let texts = vec!["a".to_string(), "abc".to_string(), "ab".to_string()];
        let embeddings = Lengths.embed_batch(&texts).await.unwrap();
        let values: Vec<f32> = embeddings.iter().map(|e| e.values[0]).collect();
        assert_eq!(values, vec![1.0, 3.0, 2.0]);
    }
}
