//! In-memory engine implementations for tests and offline development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use super::{
    DistanceKind, Embedder, EngineError, GenerateOptions, GenerateOutcome, Generator,
    PayloadFilter, PointKey, PointRecord, ScoredHit, TokenStream, VectorIndex,
};

/// Generator that replays a fixed token sequence.
pub struct MockGenerator {
    chunks: Vec<String>,
    chunk_delay: Duration,
    first_chunk_delay: Duration,
    fail_stream: bool,
}

impl MockGenerator {
    pub fn new(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(str::to_string).collect(),
            chunk_delay: Duration::ZERO,
            first_chunk_delay: Duration::ZERO,
            fail_stream: false,
        }
    }

    /// Delay between consecutive stream chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Extra delay before the first chunk, for exercising heartbeats and the
    /// first-token race.
    pub fn with_first_chunk_delay(mut self, delay: Duration) -> Self {
        self.first_chunk_delay = delay;
        self
    }

    /// Make the stream fail after the first chunk.
    pub fn with_stream_failure(mut self) -> Self {
        self.fail_stream = true;
        self
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _model: Option<&str>,
        _options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EngineError> {
        let response = self.chunks.join("");
        let raw = serde_json::json!({"response": response.clone(), "done": true});
        Ok(GenerateOutcome { response, raw })
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _model: Option<&str>,
        _options: &GenerateOptions,
    ) -> Result<TokenStream, EngineError> {
        let chunk_delay = self.chunk_delay;
        let first_delay = self.first_chunk_delay;
        let fail = self.fail_stream;
        let items: Vec<(usize, String)> = self.chunks.iter().cloned().enumerate().collect();

        let stream = futures::stream::iter(items).then(move |(i, chunk)| async move {
            if i == 0 {
                tokio::time::sleep(first_delay).await;
            } else {
                tokio::time::sleep(chunk_delay).await;
            }
            if fail && i == 1 {
                Err(EngineError::Request {
                    reason: "mock stream failure".to_string(),
                })
            } else {
                Ok(chunk)
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Embedder producing deterministic fixed-dimension vectors.
pub struct MockEmbedder {
    dimension: usize,
    fail: bool,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            dimension: 0,
            fail: true,
        }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        _model: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, EngineError> {
        if self.fail {
            return Err(EngineError::Request {
                reason: "mock embedder failure".to_string(),
            });
        }
        Ok(texts
            .iter()
            .map(|text| {
                let seed = text.bytes().fold(1u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                (0..self.dimension)
                    .map(|i| ((seed.wrapping_add(i as u32) % 97) as f32) / 97.0)
                    .collect()
            })
            .collect())
    }
}

struct MemoryCollection {
    size: u64,
    distance: DistanceKind,
    points: Vec<PointRecord>,
}

/// Process-local vector index backed by plain vectors and linear scans.
#[derive(Default)]
pub struct MemoryVectorIndex {
    collections: Mutex<HashMap<String, MemoryCollection>>,
    /// Number of `search` calls observed; lets tests assert that a path
    /// short-circuited before retrieval.
    pub search_calls: AtomicUsize,
    /// Optional raw info document override, for exercising the schema probe.
    info_override: Mutex<Option<serde_json::Value>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_info_override(&self, info: serde_json::Value) {
        *self.info_override.lock() = Some(info);
    }

    fn matches(point: &PointRecord, filters: Option<&PayloadFilter>) -> bool {
        let Some(filters) = filters else { return true };
        let payload = match &point.payload {
            Some(serde_json::Value::Object(map)) => map,
            _ => return filters.is_empty(),
        };
        filters.iter().all(|(k, v)| payload.get(k) == Some(v))
    }

    fn score(distance: DistanceKind, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        match distance {
            DistanceKind::Dot => dot,
            DistanceKind::Cosine => {
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
            DistanceKind::Euclid => {
                let dist: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                -dist
            }
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn collection_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.collections.lock().contains_key(name))
    }

    async fn get_info(&self, name: &str) -> Result<serde_json::Value, EngineError> {
        if let Some(info) = self.info_override.lock().clone() {
            return Ok(info);
        }
        let collections = self.collections.lock();
        let coll = collections.get(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        Ok(serde_json::json!({
            "status": 1,
            "points_count": coll.points.len(),
            "config": {
                "params": {
                    "vectors": {"size": coll.size, "distance": coll.distance.to_string()}
                }
            }
        }))
    }

    async fn ensure(
        &self,
        name: &str,
        size: u64,
        distance: DistanceKind,
    ) -> Result<(), EngineError> {
        let mut collections = self.collections.lock();
        match collections.get(name) {
            Some(existing) if existing.size == size => {}
            _ => {
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        size,
                        distance,
                        points: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, EngineError> {
        let mut names: Vec<String> = self.collections.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), EngineError> {
        self.collections.lock().remove(name);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), EngineError> {
        let mut collections = self.collections.lock();
        let coll = collections.get_mut(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        coll.points.clear();
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), EngineError> {
        let mut collections = self.collections.lock();
        let coll = collections.get_mut(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        for point in points {
            if let Some(existing) = coll.points.iter_mut().find(|p| p.id == point.id) {
                *existing = point;
            } else {
                coll.points.push(point);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: u64,
        filters: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredHit>, EngineError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let collections = self.collections.lock();
        let coll = collections.get(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        let mut hits: Vec<ScoredHit> = coll
            .points
            .iter()
            .filter(|p| Self::matches(p, filters))
            .filter_map(|p| {
                let stored = p.vector.as_ref()?;
                Some(ScoredHit {
                    id: p.id.clone(),
                    score: Self::score(coll.distance, stored, &vector),
                    payload: p.payload.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k as usize);
        Ok(hits)
    }

    async fn scroll(
        &self,
        name: &str,
        limit: u64,
        offset: Option<PointKey>,
        with_vectors: bool,
        with_payload: bool,
        filters: Option<&PayloadFilter>,
    ) -> Result<(Vec<PointRecord>, Option<PointKey>), EngineError> {
        let collections = self.collections.lock();
        let coll = collections.get(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        let start = match offset {
            Some(PointKey::Num(n)) => n as usize,
            Some(PointKey::Str(_)) | None => 0,
        };
        let filtered: Vec<&PointRecord> = coll
            .points
            .iter()
            .filter(|p| Self::matches(p, filters))
            .collect();
        let page: Vec<PointRecord> = filtered
            .iter()
            .skip(start)
            .take(limit as usize)
            .map(|p| PointRecord {
                id: p.id.clone(),
                vector: if with_vectors { p.vector.clone() } else { None },
                payload: if with_payload { p.payload.clone() } else { None },
            })
            .collect();
        let consumed = start + page.len();
        let next = if consumed < filtered.len() {
            Some(PointKey::Num(consumed as u64))
        } else {
            None
        };
        Ok((page, next))
    }

    async fn delete_by_ids(&self, name: &str, ids: &[PointKey]) -> Result<u64, EngineError> {
        let mut collections = self.collections.lock();
        let coll = collections.get_mut(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        let before = coll.points.len();
        coll.points.retain(|p| !ids.contains(&p.id));
        Ok((before - coll.points.len()) as u64)
    }

    async fn delete_by_filter(
        &self,
        name: &str,
        filters: &PayloadFilter,
    ) -> Result<u64, EngineError> {
        let affected = self.count(name, Some(filters), true).await?;
        let mut collections = self.collections.lock();
        let coll = collections.get_mut(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        coll.points.retain(|p| !Self::matches(p, Some(filters)));
        Ok(affected)
    }

    async fn count(
        &self,
        name: &str,
        filters: Option<&PayloadFilter>,
        _exact: bool,
    ) -> Result<u64, EngineError> {
        let collections = self.collections.lock();
        let coll = collections.get(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        Ok(coll.points.iter().filter(|p| Self::matches(p, filters)).count() as u64)
    }

    async fn retrieve(
        &self,
        name: &str,
        ids: &[PointKey],
        with_vectors: bool,
        with_payload: bool,
    ) -> Result<Vec<PointRecord>, EngineError> {
        let collections = self.collections.lock();
        let coll = collections.get(name).ok_or_else(|| EngineError::CollectionNotFound {
            name: name.to_string(),
        })?;
        Ok(coll
            .points
            .iter()
            .filter(|p| ids.contains(&p.id))
            .map(|p| PointRecord {
                id: p.id.clone(),
                vector: if with_vectors { p.vector.clone() } else { None },
                payload: if with_payload { p.payload.clone() } else { None },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_index_supports_basic_lifecycle() {
        let index = MemoryVectorIndex::new();
        index.ensure("c", 2, DistanceKind::Dot).await.unwrap();
        index
            .upsert(
                "c",
                vec![
                    PointRecord {
                        id: PointKey::Num(1),
                        vector: Some(vec![1.0, 0.0]),
                        payload: Some(json!({"tag": "a"})),
                    },
                    PointRecord {
                        id: PointKey::Num(2),
                        vector: Some(vec![0.0, 1.0]),
                        payload: Some(json!({"tag": "b"})),
                    },
                ],
            )
            .await
            .unwrap();

        let hits = index.search("c", vec![1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits[0].id, PointKey::Num(1));

        let mut filters = PayloadFilter::new();
        filters.insert("tag".into(), json!("b"));
        assert_eq!(index.count("c", Some(&filters), true).await.unwrap(), 1);
        assert_eq!(index.delete_by_filter("c", &filters).await.unwrap(), 1);
        assert_eq!(index.count("c", None, true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_scroll_pages_in_order() {
        let index = MemoryVectorIndex::new();
        index.ensure("c", 1, DistanceKind::Dot).await.unwrap();
        let points: Vec<PointRecord> = (0..5)
            .map(|i| PointRecord {
                id: PointKey::Num(i),
                vector: Some(vec![i as f32]),
                payload: None,
            })
            .collect();
        index.upsert("c", points).await.unwrap();

        let (page1, next) = index.scroll("c", 2, None, true, true, None).await.unwrap();
        assert_eq!(page1.len(), 2);
        let (page2, next2) = index.scroll("c", 2, next, true, true, None).await.unwrap();
        assert_eq!(page2.len(), 2);
        let (page3, next3) = index.scroll("c", 2, next2, true, true, None).await.unwrap();
        assert_eq!(page3.len(), 1);
        assert!(next3.is_none());
        assert_eq!(page1[0].id, PointKey::Num(0));
        assert_eq!(page3[0].id, PointKey::Num(4));
    }
}
