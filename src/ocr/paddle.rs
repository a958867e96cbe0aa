//! PaddleOCR sidecar engine.
//!
//! The sidecar keeps the models loaded and exposes two endpoints:
//! `POST /load` (warm up one language with the given settings) and
//! `POST /ocr` (multipart file upload, returns the raw nested result).

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

use super::{EngineFactory, OcrEngine, RawResult};
use crate::config::EngineSettings;

/// Model parameters sent with every sidecar call.
#[derive(Debug, Clone, Serialize)]
struct PaddleParams {
    lang: String,
    use_angle_cls: bool,
    use_gpu: bool,
    det_db_thresh: f64,
    det_db_box_thresh: f64,
    drop_score: f64,
    enable_mkldnn: bool,
    cpu_threads: u32,
    det_limit_side_len: u32,
    rec_batch_num: u32,
}

impl PaddleParams {
    fn new(language: &str, settings: &EngineSettings) -> Self {
        Self {
            lang: language.to_string(),
            use_angle_cls: settings.use_angle_cls,
            use_gpu: settings.use_gpu,
            det_db_thresh: settings.det_db_thresh,
            det_db_box_thresh: settings.det_db_box_thresh,
            drop_score: settings.drop_score,
            enable_mkldnn: settings.enable_mkldnn,
            cpu_threads: settings.cpu_threads,
            det_limit_side_len: settings.det_limit_side_len,
            rec_batch_num: settings.rec_batch_num,
        }
    }
}

pub struct PaddleSidecarEngine {
    url: String,
    client: reqwest::Client,
    params: PaddleParams,
}

#[async_trait::async_trait]
impl OcrEngine for PaddleSidecarEngine {
    fn language(&self) -> &str {
        &self.params.lang
    }

    async fn recognize(&self, image_path: &Path, angle_correction: bool) -> anyhow::Result<RawResult> {
        use reqwest::multipart::{Form, Part};

        let data = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("Failed to read upload {:?}", image_path))?;
        let filename = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        debug!(
            "PaddleSidecarEngine[{}]: sending {} ({} bytes)",
            self.params.lang,
            filename,
            data.len()
        );

        let part = Part::bytes(data)
            .file_name(filename)
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", part)
            .text("params", serde_json::to_string(&self.params)?)
            .text("cls", angle_correction.to_string());

        let response = self
            .client
            .post(format!("{}/ocr", self.url))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("PaddleOCR sidecar error ({}): {}", status, error_text);
        }

        Ok(response.json().await?)
    }
}

/// Builds [`PaddleSidecarEngine`]s, asking the sidecar to load each language.
pub struct PaddleSidecarFactory {
    client: reqwest::Client,
}

impl PaddleSidecarFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl EngineFactory for PaddleSidecarFactory {
    fn name(&self) -> &str {
        "paddleocr_sidecar"
    }

    async fn build(
        &self,
        language: &str,
        settings: &EngineSettings,
    ) -> anyhow::Result<Arc<dyn OcrEngine>> {
        let url = settings.sidecar_url.trim_end_matches('/').to_string();
        let params = PaddleParams::new(language, settings);

        info!("PaddleSidecarFactory: loading {} models from {}", language, url);
        let response = self
            .client
            .post(format!("{}/load", url))
            .json(&params)
            .send()
            .await
            .with_context(|| format!("PaddleOCR sidecar unreachable at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "PaddleOCR sidecar failed to load {} ({}): {}",
                language,
                status,
                error_text
            );
        }

        Ok(Arc::new(PaddleSidecarEngine {
            url,
            client: self.client.clone(),
            params,
        }))
    }
}
