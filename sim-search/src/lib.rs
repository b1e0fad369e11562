//! Similarity search against the customer gallery.
//!
//! The resolver consumes this behind the [SimilaritySearch] trait: cosine
//! top-k over L2-normalized 512-d vectors, plus a vector update used for the
//! gallery EMA write-back. The production backend talks to Qdrant over REST;
//! [MemoryGallery] is a brute-force implementation for tests and local runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trinetra_types::{CustomerId, Embedding};

mod memory;
mod qdrant;

pub use memory::MemoryGallery;
pub use qdrant::QdrantSearch;

#[derive(thiserror::Error, Debug)]
pub enum SimSearchError {
    #[error("similarity backend unavailable: {0}")]
    Unavailable(String),
    #[error("{source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("unexpected search response: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, SimSearchError>;

/// Metadata stored alongside each gallery vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GalleryPayload {
    #[serde(default)]
    pub vip: bool,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One gallery match, scores descending in any returned list.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub customer_id: CustomerId,
    pub score: f32,
    pub payload: GalleryPayload,
}

#[async_trait::async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// The `k` nearest gallery entries by cosine similarity, sorted
    /// descending. `ef` is the HNSW search width; billing cameras search
    /// wider than the rest.
    async fn top_k(&self, embedding: &Embedding, k: usize, ef: usize) -> Result<Vec<Candidate>>;

    /// Replace the stored vector for `customer_id`. Used only by the
    /// EMA write-back, which is gated on a high-confidence match upstream.
    async fn update(&self, customer_id: &CustomerId, embedding: &Embedding) -> Result<()>;
}
