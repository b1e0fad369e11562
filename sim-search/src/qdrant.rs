use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use trinetra_types::{CustomerId, Embedding};

use crate::{Candidate, GalleryPayload, Result, SimSearchError, SimilaritySearch};

/// Hard deadline on one search round trip.
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Qdrant REST backend.
///
/// Gallery points carry the customer id and VIP flag in their payload; the
/// Qdrant point id itself is an internal detail. Vector updates need that
/// point id, so ids observed in search results are cached per customer, and
/// an EMA write-back for a customer never seen in a search result is skipped
/// with a warning rather than failed.
pub struct QdrantSearch {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    point_ids: Arc<Mutex<HashMap<CustomerId, serde_json::Value>>>,
}

impl QdrantSearch {
    pub fn new(base_url: &str, collection: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            point_ids: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: serde_json::Map<String, serde_json::Value>,
}

fn candidate_from_point(point: ScoredPoint) -> Result<(serde_json::Value, Candidate)> {
    let mut payload = point.payload;
    let customer_id = match payload.remove("customer_id") {
        Some(serde_json::Value::String(s)) => CustomerId::new(s),
        // Fall back to the point id when the payload does not carry one.
        _ => CustomerId::new(point.id.to_string().trim_matches('"')),
    };
    let payload: GalleryPayload =
        serde_json::from_value(serde_json::Value::Object(payload))
            .map_err(|e| SimSearchError::BadResponse(e.to_string()))?;
    Ok((
        point.id,
        Candidate {
            customer_id,
            score: point.score,
            payload,
        },
    ))
}

#[async_trait::async_trait]
impl SimilaritySearch for QdrantSearch {
    async fn top_k(&self, embedding: &Embedding, k: usize, ef: usize) -> Result<Vec<Candidate>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = serde_json::json!({
            "vector": embedding.as_slice(),
            "limit": k,
            "params": { "hnsw_ef": ef },
            "with_payload": true,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SimSearchError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SimSearchError::Unavailable(format!(
                "search returned {}",
                response.status()
            )));
        }
        let parsed: SearchResponse = response.json().await?;
        let mut out = Vec::with_capacity(parsed.result.len());
        let mut ids = self.point_ids.lock();
        for point in parsed.result {
            let (point_id, candidate) = candidate_from_point(point)?;
            ids.insert(candidate.customer_id.clone(), point_id);
            out.push(candidate);
        }
        Ok(out)
    }

    async fn update(&self, customer_id: &CustomerId, embedding: &Embedding) -> Result<()> {
        let point_id = match self.point_ids.lock().get(customer_id) {
            Some(id) => id.clone(),
            None => {
                tracing::warn!(%customer_id, "no cached point id, skipping gallery update");
                return Ok(());
            }
        };
        let url = format!(
            "{}/collections/{}/points/vectors",
            self.base_url, self.collection
        );
        let body = serde_json::json!({
            "points": [ { "id": point_id, "vector": embedding.as_slice() } ],
        });
        let response = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SimSearchError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SimSearchError::Unavailable(format!(
                "vector update returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scored_point_with_payload() {
        let raw = serde_json::json!({
            "id": 17,
            "score": 0.91,
            "payload": { "customer_id": "cust_007", "vip": true, "tier": "gold" }
        });
        let point: ScoredPoint = serde_json::from_value(raw).unwrap();
        let (id, candidate) = candidate_from_point(point).unwrap();
        assert_eq!(id, serde_json::json!(17));
        assert_eq!(candidate.customer_id, CustomerId::new("cust_007"));
        assert_eq!(candidate.score, 0.91);
        assert!(candidate.payload.vip);
        assert_eq!(
            candidate.payload.metadata.get("tier"),
            Some(&serde_json::json!("gold"))
        );
    }

    #[test]
    fn falls_back_to_point_id_without_payload_customer() {
        let raw = serde_json::json!({
            "id": "9d3c-uuid",
            "score": 0.8,
            "payload": {}
        });
        let point: ScoredPoint = serde_json::from_value(raw).unwrap();
        let (_, candidate) = candidate_from_point(point).unwrap();
        assert_eq!(candidate.customer_id, CustomerId::new("9d3c-uuid"));
        assert!(!candidate.payload.vip);
    }
}
