//! Qdrant-backed vector index.
//!
//! Wraps the gRPC client behind the [`VectorIndex`] trait so the rest of the
//! gateway only sees domain types. The client is created lazily and reused
//! for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::config::QdrantConfig as ClientConfig;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, points_selector::PointsSelectorOneOf, vectors_config,
    vectors_output::VectorsOptions, with_payload_selector, with_vectors_selector, Condition,
    CountPoints, CreateCollection, DeletePoints, Distance, Filter, GetPoints, PointId, PointStruct,
    PointsIdsList, PointsSelector, RetrievedPoint, ScrollPoints, SearchPoints, UpsertPoints,
    Value as QdrantValue, VectorParams, VectorsConfig, VectorsOutput, WithPayloadSelector,
    WithVectorsSelector,
};
use qdrant_client::Qdrant;
use tokio::sync::RwLock;

use super::{
    DistanceKind, EngineError, PayloadFilter, PointKey, PointRecord, ScoredHit, VectorIndex,
};

/// Convert Qdrant errors to engine errors with specific mappings.
fn map_qdrant_error(error: qdrant_client::QdrantError) -> EngineError {
    match error {
        qdrant_client::QdrantError::ResponseError { status } => {
            let code = status.code() as i32;
            EngineError::Status {
                status: code as u16,
                body: status.message().to_string(),
            }
        }
        qdrant_client::QdrantError::ConversionError { .. } => EngineError::Decode {
            reason: "data conversion error".to_string(),
        },
        other => EngineError::Request {
            reason: format!("vector index error: {other}"),
        },
    }
}

/// Best-effort extraction of the vector dimension from a collection-info
/// document. Probes the known shapes and returns 0 when none match:
/// `config.params.vectors.size`, `params.vectors.size`, `params.size`,
/// `vectors.size`.
pub fn extract_vector_size(info: &serde_json::Value) -> u64 {
    let probes = [
        &["config", "params", "vectors", "size"][..],
        &["params", "vectors", "size"][..],
        &["params", "size"][..],
        &["vectors", "size"][..],
    ];
    for path in probes {
        let mut node = info;
        let mut found = true;
        for key in path {
            match node.get(key) {
                Some(next) => node = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(size) = node.as_u64() {
                if size > 0 {
                    return size;
                }
            }
        }
    }
    0
}

pub struct QdrantIndex {
    client: RwLock<Option<Arc<Qdrant>>>,
    url: String,
}

impl QdrantIndex {
    pub fn new(url: &str) -> Self {
        Self {
            client: RwLock::new(None),
            url: url.to_string(),
        }
    }

    async fn get_client(&self) -> Result<Arc<Qdrant>, EngineError> {
        let guard = self.client.read().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }
        drop(guard);

        let config = ClientConfig::from_url(&self.url);
        let client = Arc::new(Qdrant::new(config).map_err(map_qdrant_error)?);
        let mut guard = self.client.write().await;
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn require_collection(&self, name: &str) -> Result<Arc<Qdrant>, EngineError> {
        let client = self.get_client().await?;
        let listing = client.list_collections().await.map_err(map_qdrant_error)?;
        if !listing.collections.iter().any(|c| c.name == name) {
            return Err(EngineError::CollectionNotFound {
                name: name.to_string(),
            });
        }
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Domain ⇄ wire conversions
// ---------------------------------------------------------------------------

fn key_to_point_id(key: &PointKey) -> PointId {
    match key {
        PointKey::Num(n) => PointId::from(*n),
        PointKey::Str(s) => PointId::from(s.clone()),
    }
}

fn point_id_to_key(id: Option<&PointId>) -> PointKey {
    match id.and_then(|p| p.point_id_options.as_ref()) {
        Some(PointIdOptions::Num(n)) => PointKey::Num(*n),
        Some(PointIdOptions::Uuid(s)) => PointKey::Str(s.clone()),
        None => PointKey::Num(0),
    }
}

fn qdrant_value_to_json(value: &QdrantValue) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind;
    match &value.kind {
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(*i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_qdrant_value(value: &serde_json::Value) -> QdrantValue {
    use qdrant_client::qdrant::value::Kind;
    use qdrant_client::qdrant::{ListValue, Struct};
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_qdrant_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_qdrant_value(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn payload_to_json(payload: &HashMap<String, QdrantValue>) -> Option<serde_json::Value> {
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), qdrant_value_to_json(v)))
            .collect(),
    ))
}

fn json_to_payload(payload: Option<&serde_json::Value>) -> HashMap<String, QdrantValue> {
    match payload {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_qdrant_value(v)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// A flat filter object becomes a `must` list of equality conditions.
fn build_filter(filters: Option<&PayloadFilter>) -> Option<Filter> {
    let filters = filters?;
    if filters.is_empty() {
        return None;
    }
    let conditions: Vec<Condition> = filters
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::Bool(b) => Condition::matches(key.clone(), *b),
            serde_json::Value::Number(n) if n.is_i64() => {
                Condition::matches(key.clone(), n.as_i64().unwrap_or_default())
            }
            serde_json::Value::String(s) => Condition::matches(key.clone(), s.clone()),
            other => Condition::matches(key.clone(), other.to_string()),
        })
        .collect();
    Some(Filter::must(conditions))
}

/// Unwrap the wire vector shape. A single-named vector map collapses to its
/// lone value.
fn vectors_to_plain(vectors: Option<&VectorsOutput>) -> Option<Vec<f32>> {
    match vectors.and_then(|v| v.vectors_options.as_ref()) {
        Some(VectorsOptions::Vector(v)) => Some(v.data.clone()),
        Some(VectorsOptions::Vectors(named)) => {
            if named.vectors.len() == 1 {
                named.vectors.values().next().map(|v| v.data.clone())
            } else {
                None
            }
        }
        None => None,
    }
}

fn retrieved_to_record(point: &RetrievedPoint) -> PointRecord {
    PointRecord {
        id: point_id_to_key(point.id.as_ref()),
        vector: vectors_to_plain(point.vectors.as_ref()),
        payload: payload_to_json(&point.payload),
    }
}

fn payload_selector(enable: bool) -> WithPayloadSelector {
    WithPayloadSelector {
        selector_options: Some(with_payload_selector::SelectorOptions::Enable(enable)),
    }
}

fn vectors_selector(enable: bool) -> WithVectorsSelector {
    WithVectorsSelector {
        selector_options: Some(with_vectors_selector::SelectorOptions::Enable(enable)),
    }
}

fn distance_to_wire(distance: DistanceKind) -> Distance {
    match distance {
        DistanceKind::Cosine => Distance::Cosine,
        DistanceKind::Euclid => Distance::Euclid,
        DistanceKind::Dot => Distance::Dot,
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn collection_exists(&self, name: &str) -> Result<bool, EngineError> {
        let client = self.get_client().await?;
        let listing = client.list_collections().await.map_err(map_qdrant_error)?;
        Ok(listing.collections.iter().any(|c| c.name == name))
    }

    async fn get_info(&self, name: &str) -> Result<serde_json::Value, EngineError> {
        let client = self.get_client().await?;
        let response = client.collection_info(name).await.map_err(map_qdrant_error)?;
        let info = response.result.ok_or_else(|| EngineError::Decode {
            reason: "collection info response had no result".to_string(),
        })?;

        let mut size = 0u64;
        let mut distance = None;
        if let Some(params) = info.config.as_ref().and_then(|c| c.params.as_ref()) {
            if let Some(cfg) = params.vectors_config.as_ref().and_then(|v| v.config.as_ref()) {
                match cfg {
                    vectors_config::Config::Params(p) => {
                        size = p.size;
                        distance = Distance::try_from(p.distance).ok();
                    }
                    vectors_config::Config::ParamsMap(map) => {
                        if map.map.len() == 1 {
                            if let Some(p) = map.map.values().next() {
                                size = p.size;
                                distance = Distance::try_from(p.distance).ok();
                            }
                        }
                    }
                }
            }
        }

        Ok(serde_json::json!({
            "status": info.status,
            "points_count": info.points_count,
            "segments_count": info.segments_count,
            "config": {
                "params": {
                    "vectors": {
                        "size": size,
                        "distance": distance.map(|d| format!("{d:?}")),
                    }
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
        let client = self.get_client().await?;

        if self.collection_exists(name).await? {
            let info = self.get_info(name).await?;
            let current = extract_vector_size(&info);
            if current == size {
                return Ok(());
            }
            tracing::warn!(
                collection = name,
                current = current,
                requested = size,
                "vector size mismatch, dropping and recreating collection"
            );
            client.delete_collection(name).await.map_err(map_qdrant_error)?;
        }

        let vectors_config = VectorsConfig {
            config: Some(vectors_config::Config::Params(VectorParams {
                size,
                distance: distance_to_wire(distance) as i32,
                ..Default::default()
            })),
        };
        client
            .create_collection(CreateCollection {
                collection_name: name.to_string(),
                vectors_config: Some(vectors_config),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, EngineError> {
        let client = self.get_client().await?;
        let listing = client.list_collections().await.map_err(map_qdrant_error)?;
        Ok(listing.collections.into_iter().map(|c| c.name).collect())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), EngineError> {
        let client = self.get_client().await?;
        client.delete_collection(name).await.map_err(map_qdrant_error)?;
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), EngineError> {
        // Scroll ids in batches and delete them; works across server versions
        // without relying on an all-points selector.
        let mut offset: Option<PointKey> = None;
        loop {
            let (points, next) = self.scroll(name, 1000, offset.take(), false, false, None).await?;
            if points.is_empty() {
                break;
            }
            let ids: Vec<PointKey> = points.into_iter().map(|p| p.id).collect();
            self.delete_by_ids(name, &ids).await?;
            match next {
                Some(n) => offset = Some(n),
                None => break,
            }
        }
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), EngineError> {
        let client = self.get_client().await?;
        let wire_points: Vec<PointStruct> = points
            .iter()
            .map(|record| {
                let vector = record.vector.clone().unwrap_or_default();
                PointStruct::new(
                    key_to_point_id(&record.id),
                    vector,
                    json_to_payload(record.payload.as_ref()),
                )
            })
            .collect();

        client
            .upsert_points(UpsertPoints {
                collection_name: name.to_string(),
                wait: Some(true),
                points: wire_points,
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: u64,
        filters: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredHit>, EngineError> {
        let client = self.get_client().await?;
        let response = client
            .search_points(SearchPoints {
                collection_name: name.to_string(),
                vector,
                limit: top_k,
                filter: build_filter(filters),
                with_payload: Some(payload_selector(true)),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;

        Ok(response
            .result
            .iter()
            .map(|point| ScoredHit {
                id: point_id_to_key(point.id.as_ref()),
                score: point.score,
                payload: payload_to_json(&point.payload),
            })
            .collect())
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
        let client = self.get_client().await?;
        let response = client
            .scroll(ScrollPoints {
                collection_name: name.to_string(),
                limit: Some(limit as u32),
                offset: offset.as_ref().map(key_to_point_id),
                with_payload: Some(payload_selector(with_payload)),
                with_vectors: Some(vectors_selector(with_vectors)),
                filter: build_filter(filters),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;

        let points = response.result.iter().map(retrieved_to_record).collect();
        let next = response
            .next_page_offset
            .as_ref()
            .map(|id| point_id_to_key(Some(id)));
        Ok((points, next))
    }

    async fn delete_by_ids(&self, name: &str, ids: &[PointKey]) -> Result<u64, EngineError> {
        let client = self.get_client().await?;
        let wire_ids: Vec<PointId> = ids.iter().map(key_to_point_id).collect();
        client
            .delete_points(DeletePoints {
                collection_name: name.to_string(),
                wait: Some(true),
                points: Some(PointsSelector {
                    points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                        ids: wire_ids,
                    })),
                }),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(ids.len() as u64)
    }

    async fn delete_by_filter(
        &self,
        name: &str,
        filters: &PayloadFilter,
    ) -> Result<u64, EngineError> {
        let affected = self.count(name, Some(filters), true).await.unwrap_or(0);

        let client = self.get_client().await?;
        let filter = build_filter(Some(filters)).unwrap_or_default();
        client
            .delete_points(DeletePoints {
                collection_name: name.to_string(),
                wait: Some(true),
                points: Some(PointsSelector {
                    points_selector_one_of: Some(PointsSelectorOneOf::Filter(filter)),
                }),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(affected)
    }

    async fn count(
        &self,
        name: &str,
        filters: Option<&PayloadFilter>,
        exact: bool,
    ) -> Result<u64, EngineError> {
        let client = self.get_client().await?;
        let response = client
            .count(CountPoints {
                collection_name: name.to_string(),
                filter: build_filter(filters),
                exact: Some(exact),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn retrieve(
        &self,
        name: &str,
        ids: &[PointKey],
        with_vectors: bool,
        with_payload: bool,
    ) -> Result<Vec<PointRecord>, EngineError> {
        let client = self.require_collection(name).await?;
        let response = client
            .get_points(GetPoints {
                collection_name: name.to_string(),
                ids: ids.iter().map(key_to_point_id).collect(),
                with_payload: Some(payload_selector(with_payload)),
                with_vectors: Some(vectors_selector(with_vectors)),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(response.result.iter().map(retrieved_to_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_vector_size_probes_known_shapes() {
        let shapes = [
            json!({"config": {"params": {"vectors": {"size": 384}}}}),
            json!({"params": {"vectors": {"size": 384}}}),
            json!({"params": {"size": 384}}),
            json!({"vectors": {"size": 384}}),
        ];
        for shape in &shapes {
            assert_eq!(extract_vector_size(shape), 384, "shape: {shape}");
        }
        assert_eq!(extract_vector_size(&json!({})), 0);
        assert_eq!(extract_vector_size(&json!({"vectors": {"size": "x"}})), 0);
    }

    #[test]
    fn value_conversion_round_trips() {
        let original = json!({
            "text": "hello",
            "count": 3,
            "ratio": 0.5,
            "flag": true,
            "tags": ["a", "b"],
            "nested": {"k": "v"},
            "none": null,
        });
        let wire = json_to_qdrant_value(&original);
        assert_eq!(qdrant_value_to_json(&wire), original);
    }

    #[test]
    fn point_key_round_trips_through_wire_id() {
        for key in [PointKey::Num(42), PointKey::Str("0f".repeat(16))] {
            let wire = key_to_point_id(&key);
            assert_eq!(point_id_to_key(Some(&wire)), key);
        }
    }

    #[test]
    fn empty_filter_builds_nothing() {
        assert!(build_filter(None).is_none());
        assert!(build_filter(Some(&PayloadFilter::new())).is_none());
        let mut filters = PayloadFilter::new();
        filters.insert("tag".into(), json!("faq"));
        assert!(build_filter(Some(&filters)).is_some());
    }
}
