//! Flat nearest-neighbor index over normalized embeddings

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Brute-force inner-product index.
///
/// Vectors are expected to be L2-normalized, so the inner product is the
/// cosine similarity. Inserting an existing id replaces its vector.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        self.positions.get(id).map(|&pos| self.vectors[pos].as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(|s| s.as_str())
    }

    /// Check a vector before it enters the index
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::IndexCorruption(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::IndexCorruption(
                "Embedding contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    pub fn insert(&mut self, id: &str, vector: Vec<f32>) -> Result<()> {
        self.check_vector(&vector)?;

        match self.positions.get(id) {
            Some(&pos) => self.vectors[pos] = vector,
            None => {
                self.positions.insert(id.to_string(), self.ids.len());
                self.ids.push(id.to_string());
                self.vectors.push(vector);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.vectors.clear();
        self.positions.clear();
    }

    /// Top `top_k` ids by descending similarity; ties go to the smaller id
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "Query embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(pos, v)| (pos, dot(query, v)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.ids[a.0].cmp(&self.ids[b.0]))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| (self.ids[pos].clone(), score))
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
