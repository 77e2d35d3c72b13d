//! Background export jobs and direct streaming downloads.
//!
//! Exports spool NDJSON (optionally gzipped) to a temp file under a
//! process-wide concurrency cap, persisting progress after every row so
//! cancellation is honored promptly. Terminal jobs and their files are
//! garbage-collected after the configured TTL.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::ReceiverStream;

use super::job_store::{now_epoch, ExportJob, ExportParams, JobStatus, JobStore};
use crate::engines::{PointRecord, VectorIndex};
use crate::error::ApiError;
use crate::metrics;

const SCROLL_PAGE_SIZE: u64 = 1000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One NDJSON line for a point, with keys included per the request flags.
pub fn point_line(record: &PointRecord, with_vectors: bool, with_payload: bool) -> String {
    let mut obj = Map::new();
    obj.insert("id".to_string(), serde_json::json!(record.id));
    if with_vectors {
        obj.insert(
            "vector".to_string(),
            record.vector.clone().map(Value::from).unwrap_or(Value::Null),
        );
    }
    if with_payload {
        obj.insert(
            "payload".to_string(),
            record.payload.clone().unwrap_or(Value::Null),
        );
    }
    Value::Object(obj).to_string()
}

enum LineSink {
    Plain(std::io::BufWriter<std::fs::File>),
    Gzip(GzEncoder<std::io::BufWriter<std::fs::File>>),
}

impl LineSink {
    fn create(path: &std::path::Path, gzip: bool) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        Ok(if gzip {
            LineSink::Gzip(GzEncoder::new(writer, Compression::new(6)))
        } else {
            LineSink::Plain(writer)
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            LineSink::Plain(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
            LineSink::Gzip(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            LineSink::Plain(mut w) => w.flush(),
            LineSink::Gzip(w) => w.finish().map(|mut inner| {
                let _ = inner.flush();
            }),
        }
    }
}

enum ExportEnd {
    Cancelled,
    Failed(String),
}

/// Owns export/download concurrency and the job store.
pub struct ExportManager {
    pub jobs: Arc<JobStore>,
    export_semaphore: Arc<Semaphore>,
    download_semaphore: Arc<Semaphore>,
    ttl: Duration,
}

impl ExportManager {
    pub fn new(
        jobs: Arc<JobStore>,
        export_concurrency: usize,
        download_concurrency: usize,
        ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            export_semaphore: Arc::new(Semaphore::new(export_concurrency)),
            download_semaphore: Arc::new(Semaphore::new(download_concurrency)),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Allocate a task id, persist the pending job, and start the worker.
    pub async fn start(
        self: &Arc<Self>,
        index: Arc<dyn VectorIndex>,
        params: ExportParams,
        tenant: String,
        trace_id: Option<String>,
    ) -> String {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let job = ExportJob::new(params.clone(), tenant.clone(), trace_id.clone());
        self.jobs.save(&task_id, &job, None).await;

        tracing::info!(
            task_id = %task_id,
            collection = %params.collection,
            with_vectors = params.with_vectors,
            with_payload = params.with_payload,
            with_gzip = params.with_gzip,
            delay_ms_per_point = params.delay_ms_per_point,
            trace_id = trace_id.as_deref().unwrap_or(""),
            tenant = %tenant,
            "export_start"
        );

        let manager = Arc::clone(self);
        let worker_task = task_id.clone();
        tokio::spawn(async move {
            manager.run_export(index, worker_task).await;
        });
        task_id
    }

    /// Pull the latest cancel flag into the worker's copy so per-row saves
    /// never overwrite a cancellation raised concurrently.
    async fn sync_cancel(&self, task_id: &str, job: &mut ExportJob) -> bool {
        if let Some(latest) = self.jobs.load(task_id).await {
            job.cancelled = job.cancelled || latest.cancelled;
        }
        job.cancelled
    }

    async fn run_export(self: &Arc<Self>, index: Arc<dyn VectorIndex>, task_id: String) {
        let Some(mut job) = self.jobs.load(&task_id).await else {
            return;
        };
        job.status = JobStatus::Running;
        job.started_at = Some(now_epoch());
        self.jobs.save(&task_id, &job, None).await;

        // The slot is acquired after the status flip, so a queued job shows
        // as running while it waits for capacity.
        let permit = match Arc::clone(&self.export_semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let collection = job.params.collection.clone();
        let tenant = job.tenant.clone();
        metrics::EXPORT_RUNNING
            .with_label_values(&[collection.as_str(), tenant.as_str()])
            .inc();

        let outcome = self.write_spool(&index, &task_id, &mut job).await;

        job.finished_at = Some(now_epoch());
        let duration = job
            .finished_at
            .zip(job.started_at)
            .map(|(f, s)| (f - s).max(0.0))
            .unwrap_or(0.0);

        let status = match outcome {
            Ok(total) => {
                job.status = JobStatus::Succeeded;
                job.total = Some(total);
                JobStatus::Succeeded
            }
            Err(ExportEnd::Cancelled) => {
                job.status = JobStatus::Cancelled;
                job.error = None;
                JobStatus::Cancelled
            }
            Err(ExportEnd::Failed(error)) => {
                job.status = JobStatus::Failed;
                job.error = Some(error);
                JobStatus::Failed
            }
        };

        metrics::EXPORT_STATUS_TOTAL
            .with_label_values(&[collection.as_str(), status.as_str(), tenant.as_str()])
            .inc();
        metrics::EXPORT_DURATION_SECONDS
            .with_label_values(&[collection.as_str(), tenant.as_str()])
            .observe(duration);
        self.jobs.save(&task_id, &job, Some(self.ttl)).await;
        self.schedule_file_cleanup(task_id.clone());

        match status {
            JobStatus::Failed => tracing::error!(
                task_id = %task_id,
                collection = %collection,
                written = job.written,
                duration_ms = (duration * 1000.0) as u64,
                error = job.error.as_deref().unwrap_or(""),
                trace_id = job.trace_id.as_deref().unwrap_or(""),
                "export_finish"
            ),
            _ => tracing::info!(
                task_id = %task_id,
                status = status.as_str(),
                collection = %collection,
                written = job.written,
                duration_ms = (duration * 1000.0) as u64,
                trace_id = job.trace_id.as_deref().unwrap_or(""),
                "export_finish"
            ),
        }

        metrics::EXPORT_RUNNING
            .with_label_values(&[collection.as_str(), tenant.as_str()])
            .dec();
        drop(permit);
    }

    /// Scroll the collection into the spool file, persisting progress per row
    /// and polling cancellation before each write and after each sleep.
    async fn write_spool(
        &self,
        index: &Arc<dyn VectorIndex>,
        task_id: &str,
        job: &mut ExportJob,
    ) -> Result<u64, ExportEnd> {
        let params = job.params.clone();
        let suffix = if params.with_gzip { ".jsonl.gz" } else { ".jsonl" };
        let spool = tempfile::Builder::new()
            .prefix(&format!("export_{}_", params.collection))
            .suffix(suffix)
            .tempfile()
            .map_err(|e| ExportEnd::Failed(format!("failed to create spool file: {e}")))?;
        // The manager owns cleanup from here on.
        let (_, path) = spool
            .keep()
            .map_err(|e| ExportEnd::Failed(format!("failed to keep spool file: {e}")))?;
        job.file_path = Some(path.display().to_string());
        self.jobs.save(task_id, job, None).await;

        let mut sink = LineSink::create(&path, params.with_gzip)
            .map_err(|e| ExportEnd::Failed(format!("failed to open spool file: {e}")))?;

        let mut total: u64 = 0;
        let mut offset = None;
        loop {
            let (points, next) = index
                .scroll(
                    &params.collection,
                    SCROLL_PAGE_SIZE,
                    offset,
                    params.with_vectors,
                    params.with_payload,
                    params.filters.as_ref(),
                )
                .await
                .map_err(|e| ExportEnd::Failed(e.to_string()))?;
            if points.is_empty() {
                break;
            }
            for point in &points {
                if self.sync_cancel(task_id, job).await {
                    return Err(ExportEnd::Cancelled);
                }
                let line = point_line(point, params.with_vectors, params.with_payload);
                sink.write_line(&line)
                    .map_err(|e| ExportEnd::Failed(format!("spool write failed: {e}")))?;
                total += 1;
                job.written = total;
                self.jobs.save(task_id, job, None).await;
                metrics::EXPORT_ROWS_TOTAL
                    .with_label_values(&[params.collection.as_str(), job.tenant.as_str()])
                    .inc();
                if params.delay_ms_per_point > 0 {
                    tokio::time::sleep(Duration::from_millis(params.delay_ms_per_point)).await;
                }
                // A cancel raised during the write or the sleep lands here.
                if self.sync_cancel(task_id, job).await {
                    return Err(ExportEnd::Cancelled);
                }
            }
            match next {
                Some(n) => offset = Some(n),
                None => break,
            }
        }

        if self.sync_cancel(task_id, job).await {
            return Err(ExportEnd::Cancelled);
        }
        sink.finish()
            .map_err(|e| ExportEnd::Failed(format!("spool flush failed: {e}")))?;
        Ok(total)
    }

    /// Remove the spool file and the job record once the TTL elapses.
    fn schedule_file_cleanup(self: &Arc<Self>, task_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.ttl).await;
            let Some(job) = manager.jobs.load(&task_id).await else {
                return;
            };
            if let Some(path) = &job.file_path {
                let _ = std::fs::remove_file(path);
            }
            manager.jobs.delete(&task_id).await;
        });
    }

    /// Periodic sweep over process-local jobs: terminal and past TTL means
    /// the file and record go away. Deletion is best-effort and idempotent.
    pub fn spawn_cleanup_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let cutoff = now_epoch() - manager.ttl.as_secs_f64();
                for (task_id, job) in manager.jobs.local_jobs() {
                    let finished = job.finished_at.unwrap_or(f64::MAX);
                    if job.status.is_terminal() && finished < cutoff {
                        if let Some(path) = &job.file_path {
                            let _ = std::fs::remove_file(path);
                        }
                        manager.jobs.delete(&task_id).await;
                    }
                }
                tokio::time::sleep(CLEANUP_INTERVAL).await;
            }
        });
    }

    /// Direct streaming download. Responds 429 immediately when every slot is
    /// held; otherwise holds a slot until the stream ends, including on
    /// client disconnect.
    pub fn stream_download(
        self: &Arc<Self>,
        index: Arc<dyn VectorIndex>,
        tenant: String,
        params: DownloadParams,
    ) -> Result<Response, ApiError> {
        let permit = match Arc::clone(&self.download_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(ApiError::RateLimited(
                    "too many concurrent downloads".to_string(),
                ))
            }
        };

        let gzip_label = if params.gzip { "true" } else { "false" };
        metrics::DOWNLOAD_RUNNING
            .with_label_values(&[params.collection.as_str(), gzip_label, tenant.as_str()])
            .inc();
        tracing::info!(
            collection = %params.collection,
            gzip = params.gzip,
            with_vectors = params.with_vectors,
            with_payload = params.with_payload,
            delay_ms_per_point = params.delay_ms_per_point,
            "download_start"
        );

        let filename = format!(
            "{}.jsonl{}",
            params.collection,
            if params.gzip { ".gz" } else { "" }
        );

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
        let task_params = params.clone();
        tokio::spawn(async move {
            let params = task_params;
            let started = Instant::now();
            let mut rows: u64 = 0;
            let mut bytes_out: u64 = 0;
            let gzip_label = if params.gzip { "true" } else { "false" };
            let mut encoder = params
                .gzip
                .then(|| GzEncoder::new(Vec::new(), Compression::new(6)));

            let mut offset = None;
            'outer: loop {
                let page = index
                    .scroll(
                        &params.collection,
                        SCROLL_PAGE_SIZE,
                        offset.take(),
                        params.with_vectors,
                        params.with_payload,
                        params.filters.as_ref(),
                    )
                    .await;
                let (points, next) = match page {
                    Ok(page) => page,
                    // The stream is already committed; ending it early is the
                    // only signal left for the client.
                    Err(e) => {
                        tracing::warn!(collection = %params.collection, error = %e, "download scroll failed");
                        break;
                    }
                };
                if points.is_empty() {
                    break;
                }
                for point in &points {
                    let mut line =
                        point_line(point, params.with_vectors, params.with_payload);
                    line.push('\n');
                    rows += 1;
                    let chunk = match encoder.as_mut() {
                        Some(enc) => {
                            if enc.write_all(line.as_bytes()).is_err() {
                                break 'outer;
                            }
                            std::mem::take(enc.get_mut())
                        }
                        None => line.into_bytes(),
                    };
                    if !chunk.is_empty() {
                        bytes_out += chunk.len() as u64;
                        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                            break 'outer;
                        }
                    }
                    if params.delay_ms_per_point > 0 {
                        tokio::time::sleep(Duration::from_millis(params.delay_ms_per_point)).await;
                    }
                }
                match next {
                    Some(n) => offset = Some(n),
                    None => break,
                }
            }

            if let Some(enc) = encoder {
                if let Ok(tail) = enc.finish() {
                    if !tail.is_empty() {
                        bytes_out += tail.len() as u64;
                        let _ = tx.send(Ok(Bytes::from(tail))).await;
                    }
                }
            }

            let duration = started.elapsed();
            metrics::DOWNLOAD_DURATION_SECONDS
                .with_label_values(&[params.collection.as_str(), gzip_label, tenant.as_str()])
                .observe(duration.as_secs_f64());
            metrics::DOWNLOAD_BYTES_TOTAL
                .with_label_values(&[params.collection.as_str(), gzip_label, tenant.as_str()])
                .inc_by(bytes_out as f64);
            metrics::DOWNLOAD_ROWS_TOTAL
                .with_label_values(&[params.collection.as_str(), tenant.as_str()])
                .inc_by(rows as f64);
            metrics::DOWNLOAD_RUNNING
                .with_label_values(&[params.collection.as_str(), gzip_label, tenant.as_str()])
                .dec();
            tracing::info!(
                collection = %params.collection,
                gzip = params.gzip,
                rows,
                bytes = bytes_out,
                duration_ms = duration.as_millis() as u64,
                "download_finish"
            );
            drop(permit);
        });

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            );
        if params.gzip {
            builder = builder.header(header::CONTENT_ENCODING, "gzip");
        }
        builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .map_err(|e| ApiError::Internal(format!("failed to build download response: {e}")))
    }
}

/// Query parameters of the direct download endpoint.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub collection: String,
    pub with_vectors: bool,
    pub with_payload: bool,
    pub filters: Option<Map<String, Value>>,
    pub gzip: bool,
    pub delay_ms_per_point: u64,
}

/// Synchronous export: the whole collection as one NDJSON body.
pub async fn inline_export(
    index: &Arc<dyn VectorIndex>,
    params: &ExportParams,
) -> Result<String, ApiError> {
    let mut lines = Vec::new();
    let mut offset = None;
    loop {
        let (points, next) = index
            .scroll(
                &params.collection,
                SCROLL_PAGE_SIZE,
                offset.take(),
                params.with_vectors,
                params.with_payload,
                params.filters.as_ref(),
            )
            .await
            .map_err(ApiError::from)?;
        if points.is_empty() {
            break;
        }
        for point in &points {
            lines.push(point_line(point, params.with_vectors, params.with_payload));
        }
        match next {
            Some(n) => offset = Some(n),
            None => break,
        }
    }
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{PointKey, PointRecord};
    use serde_json::json;

    #[test]
    fn point_line_includes_keys_per_flags() {
        let record = PointRecord {
            id: PointKey::Num(1),
            vector: Some(vec![0.5, 0.25]),
            payload: Some(json!({"text": "hello"})),
        };
        let full: Value = serde_json::from_str(&point_line(&record, true, true)).unwrap();
        assert_eq!(full["id"], 1);
        assert_eq!(full["vector"][0], 0.5);
        assert_eq!(full["payload"]["text"], "hello");

        let no_vec: Value = serde_json::from_str(&point_line(&record, false, true)).unwrap();
        assert!(no_vec.get("vector").is_none());
        assert!(no_vec.get("payload").is_some());

        let id_only: Value = serde_json::from_str(&point_line(&record, false, false)).unwrap();
        assert_eq!(id_only.as_object().unwrap().len(), 1);
    }

    #[test]
    fn missing_vector_serializes_null_when_requested() {
        let record = PointRecord {
            id: PointKey::Str("a".to_string()),
            vector: None,
            payload: None,
        };
        let line: Value = serde_json::from_str(&point_line(&record, true, true)).unwrap();
        assert_eq!(line["vector"], Value::Null);
        assert_eq!(line["payload"], Value::Null);
    }
}
