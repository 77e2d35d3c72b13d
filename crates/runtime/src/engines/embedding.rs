//! Ollama-compatible embedding client.

use std::time::Duration;

use async_trait::async_trait;

use super::{Embedder, EngineError};

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: &str,
        default_model: &str,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Request {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let model = model.unwrap_or(&self.default_model);

        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let body = serde_json::json!({
                "model": model,
                "prompt": text,
            });
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::Request {
                    reason: format!("embeddings request failed: {e}"),
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                return Err(EngineError::Status {
                    status: status.as_u16(),
                    body: body_text,
                });
            }

            let data: serde_json::Value = resp.json().await.map_err(|e| EngineError::Decode {
                reason: format!("embeddings response was not JSON: {e}"),
            })?;
            let vector = data
                .get("embedding")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_f64())
                        .map(|x| x as f32)
                        .collect::<Vec<f32>>()
                })
                .unwrap_or_default();
            vectors.push(vector);
        }
        Ok(vectors)
    }
}
