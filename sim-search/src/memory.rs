use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use trinetra_types::{CustomerId, Embedding};

use crate::{Candidate, GalleryPayload, Result, SimSearchError, SimilaritySearch};

/// Brute-force in-process gallery.
///
/// Exact rather than approximate, so tests get deterministic rankings. The
/// `set_unavailable` switch simulates a backend outage without tearing
/// anything down.
#[derive(Clone, Default)]
pub struct MemoryGallery {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CustomerId, (Embedding, GalleryPayload)>,
    unavailable: bool,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer_id: CustomerId, embedding: Embedding, payload: GalleryPayload) {
        self.inner
            .lock()
            .entries
            .insert(customer_id, (embedding, payload));
    }

    /// Make subsequent calls fail as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    pub fn embedding_of(&self, customer_id: &CustomerId) -> Option<Embedding> {
        self.inner
            .lock()
            .entries
            .get(customer_id)
            .map(|(e, _)| e.clone())
    }
}

#[async_trait::async_trait]
impl SimilaritySearch for MemoryGallery {
    async fn top_k(&self, embedding: &Embedding, k: usize, _ef: usize) -> Result<Vec<Candidate>> {
        let inner = self.inner.lock();
        if inner.unavailable {
            return Err(SimSearchError::Unavailable("gallery offline".into()));
        }
        let mut scored: Vec<Candidate> = inner
            .entries
            .iter()
            .map(|(id, (e, payload))| Candidate {
                customer_id: id.clone(),
                score: embedding.cosine(e),
                payload: payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn update(&self, customer_id: &CustomerId, embedding: &Embedding) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(SimSearchError::Unavailable("gallery offline".into()));
        }
        match inner.entries.get_mut(customer_id) {
            Some((stored, _)) => {
                *stored = embedding.clone();
                Ok(())
            }
            None => Err(SimSearchError::BadResponse(format!(
                "unknown customer \"{customer_id}\""
            ))),
        }
    }
}
