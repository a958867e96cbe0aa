//! Response payloads for `/process` and `/analyze`.

use serde::Serialize;

use crate::normalize::{RecognitionBatch, TextBlock};
use crate::orientation::{Orientation, OrientationTally};
use crate::stats::{round_to, unix_now};

/// Per-request facts that are not part of the recognition result.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub filename: String,
    pub language: String,
    /// Seconds from arrival until the response was assembled.
    pub processing_time: f64,
    pub ocr_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub request_id: String,
    pub text: String,
    pub total_blocks: usize,
    pub filename: String,
    pub language: String,
    pub avg_confidence: Option<f64>,
    pub processing_time: f64,
    pub ocr_version: String,
    pub has_coordinates: bool,
    pub text_orientations: OrientationTally,
    pub timestamp: f64,
    #[serde(flatten)]
    pub details: Option<DetailedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
}

/// Extra fields present only when `detailed=true`.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedFields {
    pub blocks: Vec<BlockView>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub total_coordinates: usize,
    pub quality: QualityBuckets,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockView {
    pub block_id: usize,
    pub text: String,
    pub confidence: f64,
    pub coordinates: Vec<[f64; 2]>,
    pub orientation: Orientation,
}

impl BlockView {
    fn new(block_id: usize, block: &TextBlock) -> Self {
        Self {
            block_id,
            text: block.text.clone(),
            confidence: round_to(block.confidence, 3),
            coordinates: block.quadrilateral.iter().map(|p| [p.x, p.y]).collect(),
            orientation: block.orientation,
        }
    }
}

/// Confidence histogram: high `> 0.9`, medium `[0.7, 0.9]`, low `< 0.7`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityBuckets {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QualityBuckets {
    pub fn from_batch(batch: &RecognitionBatch) -> Self {
        let mut buckets = Self::default();
        for block in &batch.blocks {
            let c = block.confidence;
            if c > 0.9 {
                buckets.high += 1;
            } else if c >= 0.7 {
                buckets.medium += 1;
            } else {
                buckets.low += 1;
            }
        }
        buckets
    }
}

/// Assemble the `/process` payload.
pub fn build(batch: &RecognitionBatch, meta: RequestMeta, detailed: bool) -> ProcessResponse {
    let details = detailed.then(|| DetailedFields {
        blocks: batch
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| BlockView::new(i, b))
            .collect(),
        min_confidence: batch.min_confidence().map(|c| round_to(c, 3)),
        max_confidence: batch.max_confidence().map(|c| round_to(c, 3)),
        total_coordinates: batch.len(),
        quality: QualityBuckets::from_batch(batch),
    });

    ProcessResponse {
        success: true,
        request_id: meta.request_id,
        text: batch.text(),
        total_blocks: batch.len(),
        filename: meta.filename,
        language: meta.language,
        avg_confidence: batch.avg_confidence().map(|c| round_to(c, 3)),
        processing_time: round_to(meta.processing_time, 3),
        ocr_version: meta.ocr_version,
        has_coordinates: !batch.is_empty(),
        text_orientations: batch.orientations(),
        timestamp: unix_now(),
        details,
        saved_to: None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    pub request_id: String,
    pub analysis: String,
    pub raw_data: AnalysisData,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisData {
    pub total_blocks: usize,
    pub avg_confidence: Option<f64>,
    pub processing_time: f64,
    pub orientations: OrientationTally,
    pub filename: String,
    pub language: String,
}

/// Assemble the `/analyze` payload: a numbered, human-readable block listing.
pub fn analysis(batch: &RecognitionBatch, meta: RequestMeta) -> AnalysisResponse {
    let avg = batch.avg_confidence();
    let orientations = batch.orientations();
    let rule = "=".repeat(60);

    let mut lines = vec![
        "All recognized blocks:".to_string(),
        format!("Total blocks: {}", batch.len()),
        format!("Confidence: {:.1}%", avg.unwrap_or(0.0) * 100.0),
        format!("Time: {:.3}s", meta.processing_time),
        rule.clone(),
    ];
    for (i, block) in batch.blocks.iter().enumerate() {
        lines.push(format!(
            "{:2}. {} \"{}\" ({:.3})",
            i + 1,
            marker(block.orientation),
            block.text,
            block.confidence
        ));
    }
    lines.push(rule);
    lines.push(format!(
        "Orientations: {} horizontal, {} vertical, {} rotated",
        orientations.horizontal, orientations.vertical, orientations.rotated
    ));

    AnalysisResponse {
        success: true,
        request_id: meta.request_id,
        analysis: lines.join("\n"),
        raw_data: AnalysisData {
            total_blocks: batch.len(),
            avg_confidence: avg.map(|c| round_to(c, 3)),
            processing_time: round_to(meta.processing_time, 3),
            orientations,
            filename: meta.filename,
            language: meta.language,
        },
    }
}

fn marker(orientation: Orientation) -> &'static str {
    match orientation {
        Orientation::Horizontal => "[H]",
        Orientation::Vertical => "[V]",
        Orientation::Rotated => "[R]",
    }
}
