//! Audit dumps of full responses, written when a client sends `save_result=true`.

use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// One persisted response.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub saved_at: String,
    pub upload_sha256: String,
    pub upload_bytes: u64,
    pub response: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        request_id: &str,
        upload_sha256: String,
        upload_bytes: u64,
        response: serde_json::Value,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            upload_sha256,
            upload_bytes,
            response,
        }
    }
}

/// Destination for audit records. Returns where the record went.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn save(&self, record: &AuditRecord) -> anyhow::Result<String>;
}

/// Writes each record as a timestamped JSON file in a directory.
pub struct FileAuditSink {
    dir: PathBuf,
}

impl FileAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    async fn save(&self, record: &AuditRecord) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create audit dir {:?}", self.dir))?;

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("ocr_result_{}_{}.json", stamp, record.request_id));
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write audit record {:?}", path))?;

        debug!("FileAuditSink: wrote {:?}", path);
        Ok(path.display().to_string())
    }
}

/// Streaming SHA-256 of an upload.
#[derive(Default)]
pub struct UploadDigest {
    hasher: Sha256,
    bytes: u64,
}

impl UploadDigest {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
