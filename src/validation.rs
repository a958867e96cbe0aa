//! Upload validation: extension allow-list, size ceiling, filename sanitizing.

use std::io::{Seek, SeekFrom};

/// Extensions accepted by `/process` and `/analyze`.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "pdf", "bmp", "tiff", "tif"];

/// Check the text after the last `.` against the allow-list, case-insensitively.
pub fn is_allowed_extension(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Measure a stream by seeking to its end and back.
///
/// The read position is restored before returning. A stream that cannot be
/// measured is treated as too large.
pub fn is_within_size_limit<S: Seek>(stream: &mut S, max_bytes: u64) -> bool {
    let Ok(original) = stream.stream_position() else {
        return false;
    };
    let size = stream.seek(SeekFrom::End(0));
    if stream.seek(SeekFrom::Start(original)).is_err() {
        return false;
    }
    match size {
        Ok(size) => size <= max_bytes,
        Err(_) => false,
    }
}

/// Reduce a client-supplied filename to a safe basename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Lower-cased extension of an already validated filename.
pub fn extension_of(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}
