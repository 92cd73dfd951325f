//! Shared fixtures for unit tests.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::Embedding;
use std::collections::HashMap;

/// Provider that answers from a fixed photo -> vectors table and counts calls.
#[derive(Default)]
pub struct FakeProvider {
    photos: HashMap<Vec<u8>, Vec<Embedding>>,
    pub calls: usize,
}

impl FakeProvider {
    pub fn with(mut self, photo: &[u8], faces: &[&[f32]]) -> Self {
        self.photos.insert(
            photo.to_vec(),
            faces.iter().map(|f| Embedding::new(f.to_vec())).collect(),
        );
        self
    }
}

impl EmbeddingProvider for FakeProvider {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ProviderError> {
        self.calls += 1;
        Ok(self.photos.get(image).cloned().unwrap_or_default())
    }
}
