//! OCR engine abstraction.
//!
//! Defines the [`OcrEngine`] trait every recognition backend implements and the
//! [`EngineFactory`] used by the registry to build one engine per language.

pub mod paddle;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use crate::config::EngineSettings;

/// Raw, engine-defined recognition payload. Normalized downstream.
pub type RawResult = serde_json::Value;

/// A loaded recognition engine bound to one language.
///
/// Implementations must tolerate concurrent calls, or the registry must be
/// configured with `max_concurrent_calls`.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn language(&self) -> &str;
    async fn recognize(&self, image_path: &Path, angle_correction: bool) -> anyhow::Result<RawResult>;
}

/// Builds engines for the registry.
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;
    async fn build(
        &self,
        language: &str,
        settings: &EngineSettings,
    ) -> anyhow::Result<Arc<dyn OcrEngine>>;
}

/// Failures of a recognition call, as seen by the request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("OCR engine not available")]
    Unavailable,

    #[error("OCR engine timed out after {0}s")]
    Timeout(u64),

    #[error("OCR engine failed: {0}")]
    Failed(#[from] anyhow::Error),
}
