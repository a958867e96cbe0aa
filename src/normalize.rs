//! Normalization of raw engine output into typed text blocks.
//!
//! The engine returns a loosely nested JSON tree, usually
//! `pages -> lines -> [quadrilateral, [text, confidence]]`, sometimes with the
//! page level flattened away or pages set to `null`. Each line either becomes a
//! whole [`TextBlock`] or is skipped with a [`SkipReason`]; a bad line never
//! fails the batch.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::orientation::{self, Orientation, OrientationTally, Point};

/// One recognized text region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBlock {
    pub text: String,
    pub confidence: f64,
    pub quadrilateral: Vec<Point>,
    pub orientation: Orientation,
}

/// All blocks recognized in one file, in engine emission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionBatch {
    pub blocks: Vec<TextBlock>,
}

impl RecognitionBatch {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// `None` for an empty batch, never `0.0`.
    pub fn avg_confidence(&self) -> Option<f64> {
        if self.blocks.is_empty() {
            return None;
        }
        let sum: f64 = self.blocks.iter().map(|b| b.confidence).sum();
        Some(sum / self.blocks.len() as f64)
    }

    pub fn min_confidence(&self) -> Option<f64> {
        self.confidences().reduce(f64::min)
    }

    pub fn max_confidence(&self) -> Option<f64> {
        self.confidences().reduce(f64::max)
    }

    pub fn orientations(&self) -> OrientationTally {
        self.blocks.iter().map(|b| b.orientation).collect()
    }

    /// Block texts joined by newlines.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn confidences(&self) -> impl Iterator<Item = f64> + '_ {
        self.blocks.iter().map(|b| b.confidence)
    }
}

/// Why a raw line was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NotALine,
    TooFewComponents(usize),
    MissingTextPair,
    EmptyText,
    BadConfidence(String),
    BadQuadrilateral,
    BelowFloor(f64),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotALine => write!(f, "element is not a sequence"),
            SkipReason::TooFewComponents(n) => write!(f, "expected 2 components, got {}", n),
            SkipReason::MissingTextPair => write!(f, "missing [text, confidence] pair"),
            SkipReason::EmptyText => write!(f, "empty text"),
            SkipReason::BadConfidence(raw) => write!(f, "unparseable confidence {}", raw),
            SkipReason::BadQuadrilateral => write!(f, "quadrilateral is not a list of 4+ points"),
            SkipReason::BelowFloor(c) => write!(f, "confidence {:.3} below floor", c),
        }
    }
}

/// Flatten a raw engine payload into a batch.
///
/// `min_confidence` drops lines whose confidence is at or below the floor.
pub fn normalize(raw: &Value, min_confidence: Option<f64>) -> RecognitionBatch {
    let raw = match raw {
        Value::Object(map) => map.get("result").unwrap_or(&Value::Null),
        other => other,
    };
    let Value::Array(outer) = raw else {
        if !raw.is_null() {
            debug!("Normalizer: top-level payload is not a list, ignoring");
        }
        return RecognitionBatch::default();
    };

    let mut blocks = Vec::new();
    let mut skipped = 0usize;

    for entry in outer {
        // A page is a list of lines; a flattened payload holds lines directly.
        let lines: Vec<&Value> = if looks_like_line(entry) {
            vec![entry]
        } else {
            match entry {
                Value::Array(items) => items.iter().collect(),
                Value::Null => continue,
                other => vec![other],
            }
        };

        for line in lines {
            match parse_line(line, min_confidence) {
                Ok(block) => blocks.push(block),
                Err(reason) => {
                    skipped += 1;
                    debug!("Normalizer: skipping element: {}", reason);
                }
            }
        }
    }

    debug!(
        "Normalizer: {} blocks kept, {} elements skipped",
        blocks.len(),
        skipped
    );
    RecognitionBatch { blocks }
}

/// A line is `[quad, [text, conf], ...]` where `quad` starts with a numeric
/// `[x, y]` point. A page starts with a line, whose own first element is a
/// list, so a malformed line inside a page never makes the page look like one.
fn looks_like_line(value: &Value) -> bool {
    match value {
        Value::Array(parts) => match parts.first() {
            Some(Value::Array(quad)) => quad.first().map_or(false, is_point),
            _ => false,
        },
        _ => false,
    }
}

fn is_point(value: &Value) -> bool {
    matches!(value, Value::Array(xy) if xy.len() >= 2 && xy[0].is_number() && xy[1].is_number())
}

fn parse_line(line: &Value, min_confidence: Option<f64>) -> Result<TextBlock, SkipReason> {
    let Value::Array(parts) = line else {
        return Err(SkipReason::NotALine);
    };
    if parts.len() < 2 {
        return Err(SkipReason::TooFewComponents(parts.len()));
    }

    let pair = match &parts[1] {
        Value::Array(pair) if pair.len() >= 2 => pair,
        _ => return Err(SkipReason::MissingTextPair),
    };

    let text = coerce_text(&pair[0]);
    if text.is_empty() {
        return Err(SkipReason::EmptyText);
    }

    let confidence =
        coerce_confidence(&pair[1]).ok_or_else(|| SkipReason::BadConfidence(pair[1].to_string()))?;
    if let Some(floor) = min_confidence {
        if confidence <= floor {
            return Err(SkipReason::BelowFloor(confidence));
        }
    }

    let quadrilateral = parse_quadrilateral(&parts[0]).ok_or(SkipReason::BadQuadrilateral)?;
    let orientation = orientation::classify(&quadrilateral);

    Ok(TextBlock {
        text,
        confidence,
        quadrilateral,
        orientation,
    })
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Numbers or numeric strings, clamped into `[0, 1]`.
fn coerce_confidence(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    raw.is_finite().then(|| raw.clamp(0.0, 1.0))
}

/// At least four numeric points; anything shorter is not a region.
fn parse_quadrilateral(value: &Value) -> Option<Vec<Point>> {
    let Value::Array(points) = value else {
        return None;
    };
    if points.len() < 4 {
        return None;
    }
    points
        .iter()
        .map(|p| match p {
            Value::Array(xy) if xy.len() >= 2 => Some(Point::new(xy[0].as_f64()?, xy[1].as_f64()?)),
            _ => None,
        })
        .collect()
}
