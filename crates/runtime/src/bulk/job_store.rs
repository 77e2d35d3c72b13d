//! Export job records and the job store capability.
//!
//! Jobs always live in the process-local map; when a Redis URL is configured
//! they are mirrored into the external store under `export:job:<task_id>` so
//! status and cancellation survive restarts. External writes are best-effort:
//! a failing store never breaks the worker.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Seconds since the epoch, as stored on job records.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Parameters of a background export, kept on the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportParams {
    pub collection: String,
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
    #[serde(default = "default_true")]
    pub with_vectors: bool,
    #[serde(default = "default_true")]
    pub with_payload: bool,
    /// Per-row delay, for exercising cancellation on small datasets.
    #[serde(default)]
    pub delay_ms_per_point: u64,
    #[serde(default)]
    pub with_gzip: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub status: JobStatus,
    pub created_at: f64,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub finished_at: Option<f64>,
    pub params: ExportParams,
    pub written: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub cancelled: bool,
    /// Request id of the start call, kept for correlating across restarts.
    #[serde(default)]
    pub trace_id: Option<String>,
    pub tenant: String,
}

impl ExportJob {
    pub fn new(params: ExportParams, tenant: String, trace_id: Option<String>) -> Self {
        Self {
            status: JobStatus::Pending,
            created_at: now_epoch(),
            started_at: None,
            finished_at: None,
            params,
            written: 0,
            total: None,
            file_path: None,
            error: None,
            cancelled: false,
            trace_id,
            tenant,
        }
    }
}

pub struct JobStore {
    redis: Option<redis::aio::ConnectionManager>,
    local: DashMap<String, ExportJob>,
}

impl JobStore {
    /// Process-local store only.
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            local: DashMap::new(),
        }
    }

    /// Connect the external store when configured; fall back to the local map
    /// when the connection cannot be established.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                    Ok(manager) => {
                        tracing::info!(url = url, "export job store backed by redis");
                        Some(manager)
                    }
                    Err(e) => {
                        tracing::warn!(url = url, error = %e, "redis unavailable, using in-memory job store");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(url = url, error = %e, "invalid redis url, using in-memory job store");
                    None
                }
            },
            None => None,
        };
        Self {
            redis,
            local: DashMap::new(),
        }
    }

    fn key(task_id: &str) -> String {
        format!("export:job:{task_id}")
    }

    pub async fn load(&self, task_id: &str) -> Option<ExportJob> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let fetched: redis::RedisResult<Option<String>> = conn.get(Self::key(task_id)).await;
            if let Ok(Some(raw)) = fetched {
                if let Ok(job) = serde_json::from_str::<ExportJob>(&raw) {
                    return Some(job);
                }
            }
        }
        self.local.get(task_id).map(|j| j.clone())
    }

    pub async fn save(&self, task_id: &str, job: &ExportJob, expire: Option<Duration>) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Ok(raw) = serde_json::to_string(job) {
                let result: redis::RedisResult<()> = match expire {
                    Some(ttl) => conn.set_ex(Self::key(task_id), raw, ttl.as_secs()).await,
                    None => conn.set(Self::key(task_id), raw).await,
                };
                if let Err(e) = result {
                    tracing::warn!(task_id = task_id, error = %e, "job store write failed");
                }
            }
        }
        self.local.insert(task_id.to_string(), job.clone());
    }

    pub async fn delete(&self, task_id: &str) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let result: redis::RedisResult<()> = conn.del(Self::key(task_id)).await;
            if let Err(e) = result {
                tracing::warn!(task_id = task_id, error = %e, "job store delete failed");
            }
        }
        self.local.remove(task_id);
    }

    /// Snapshot of process-local jobs, for the periodic cleanup loop.
    pub fn local_jobs(&self) -> Vec<(String, ExportJob)> {
        self.local
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
