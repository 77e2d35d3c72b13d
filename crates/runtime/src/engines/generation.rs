//! Ollama-compatible text generation client.
//!
//! One client per process for unary calls (overall timeout) and one for
//! streaming (no overall timeout; the consumer bounds the stream). Dynamic
//! options are merged into the request payload as-is so engine knobs like
//! `num_predict`, `temperature`, `num_ctx` or `stop` pass straight through.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{EngineError, GenerateOptions, GenerateOutcome, Generator, TokenStream};

pub struct OllamaGenerator {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: String,
    default_model: String,
    keep_alive: serde_json::Value,
}

impl OllamaGenerator {
    pub fn new(
        base_url: &str,
        default_model: &str,
        keep_alive: serde_json::Value,
        generate_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(generate_timeout)
            .build()
            .map_err(|e| EngineError::Request {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        // The streaming client carries no overall timeout; generation may
        // legitimately run for minutes while tokens keep flowing.
        let stream_client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Request {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            keep_alive,
        })
    }

    fn payload(
        &self,
        prompt: &str,
        model: Option<&str>,
        options: &GenerateOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model.unwrap_or(&self.default_model),
            "prompt": prompt,
            "stream": stream,
            "keep_alive": self.keep_alive,
        });
        if let Some(map) = body.as_object_mut() {
            for (k, v) in options {
                map.insert(k.clone(), v.clone());
            }
        }
        body
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = self.payload(prompt, model, options, false);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Request {
                reason: format!("generate request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let raw: serde_json::Value = resp.json().await.map_err(|e| EngineError::Decode {
            reason: format!("generate response was not JSON: {e}"),
        })?;
        let response = raw
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(GenerateOutcome { response, raw })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        model: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<TokenStream, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = self.payload(prompt, model, options, true);

        let resp = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Request {
                reason: format!("stream request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body: body_text,
            });
        }

        // Pump NDJSON lines off the wire into a bounded channel. Dropping the
        // returned stream closes the channel, which stops the pump and drops
        // the response, releasing the connection.
        let (tx, rx) = mpsc::channel::<Result<String, EngineError>>(16);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = bytes.next() => match next {
                        Some(Ok(chunk)) => {
                            buf.extend_from_slice(&chunk);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = buf.drain(..=pos).collect();
                                if let Some(token) = decode_line(&line) {
                                    if tx.send(Ok(token)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(EngineError::Request {
                                    reason: format!("stream read failed: {e}"),
                                }))
                                .await;
                            break;
                        }
                        None => {
                            if let Some(token) = decode_line(&buf) {
                                let _ = tx.send(Ok(token)).await;
                            }
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Decode one engine NDJSON line into its token fragment.
/// Lines without a non-empty `response` field yield nothing.
fn decode_line(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(obj) => {
            let token = obj.get("response")?.as_str()?;
            if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            }
        }
        // Unparseable lines pass through raw so diagnostics are not lost.
        Err(_) => Some(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_line_extracts_token() {
        assert_eq!(
            decode_line(br#"{"response": "hel", "done": false}"#),
            Some("hel".to_string())
        );
        assert_eq!(decode_line(br#"{"response": "", "done": true}"#), None);
        assert_eq!(decode_line(br#"{"done": true}"#), None);
        assert_eq!(decode_line(b"   \n"), None);
        assert_eq!(decode_line(b"plain text"), Some("plain text".to_string()));
    }

    #[tokio::test]
    async fn payload_merges_options_over_defaults() {
        let gen = OllamaGenerator::new(
            "http://localhost:11434/",
            "m1",
            serde_json::Value::String("5m".into()),
            Duration::from_secs(10),
        )
        .unwrap();
        let mut opts = GenerateOptions::new();
        opts.insert("num_predict".into(), serde_json::json!(8));
        opts.insert("keep_alive".into(), serde_json::json!(0));
        let body = gen.payload("hi", Some("m2"), &opts, true);
        assert_eq!(body["model"], "m2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["num_predict"], 8);
        // Per-request keep_alive overrides the configured default.
        assert_eq!(body["keep_alive"], 0);
    }
}
