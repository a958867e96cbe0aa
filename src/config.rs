//! Server configuration.
//!
//! Built from defaults, then an optional JSON file (`OCR_CONFIG_PATH`), then
//! environment overrides. `.env` is loaded by `main` before this runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const RATE_LIMIT_REQUESTS: usize = 100;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub default_language: String,
    pub supported_languages: Vec<String>,
    pub max_file_size: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: usize,
    /// Key rate limiting on the first `X-Forwarded-For` hop. Only safe behind
    /// a proxy that overwrites the header; otherwise the peer address is used.
    pub trust_forwarded_for: bool,
    /// Records at or below this confidence are dropped during normalization.
    pub min_confidence: Option<f64>,
    /// Load every language at startup instead of on the first request.
    pub eager_init: bool,
    pub init_policy: InitPolicy,
    /// Directory receiving audit dumps for `save_result=true` requests.
    pub audit_dir: PathBuf,
    pub engine: EngineSettings,
}

/// What `EngineRegistry::initialize` does when a language fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// Log and continue; fail only when no language loads.
    BestEffort,
    /// Abort initialization on the first failed language.
    AllOrNothing,
}

impl InitPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "best_effort" | "best-effort" => Some(Self::BestEffort),
            "all_or_nothing" | "all-or-nothing" | "strict" => Some(Self::AllOrNothing),
            _ => None,
        }
    }
}

/// Tunables handed to every engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Base URL of the PaddleOCR sidecar.
    pub sidecar_url: String,
    pub use_angle_cls: bool,
    pub use_gpu: bool,
    pub det_db_thresh: f64,
    pub det_db_box_thresh: f64,
    pub drop_score: f64,
    pub enable_mkldnn: bool,
    pub cpu_threads: u32,
    pub det_limit_side_len: u32,
    pub rec_batch_num: u32,
    /// Deadline for a single recognition call.
    pub recognize_timeout_secs: u64,
    /// Caps in-flight calls per language. `None` means the engine is reentrant.
    pub max_concurrent_calls: Option<usize>,
    /// Version string reported in responses.
    pub ocr_version: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sidecar_url: "http://localhost:8866".to_string(),
            use_angle_cls: true,
            use_gpu: false,
            det_db_thresh: 0.1,
            det_db_box_thresh: 0.4,
            drop_score: 0.2,
            enable_mkldnn: true,
            cpu_threads: 4,
            det_limit_side_len: 960,
            rec_batch_num: 6,
            recognize_timeout_secs: 120,
            max_concurrent_calls: None,
            ocr_version: "2.8.1-cpu".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn recognize_timeout(&self) -> Duration {
        Duration::from_secs(self.recognize_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8501,
            default_language: "es".to_string(),
            supported_languages: vec!["en".to_string(), "es".to_string()],
            max_file_size: MAX_FILE_SIZE,
            rate_limit_window_secs: RATE_LIMIT_WINDOW_SECS,
            rate_limit_requests: RATE_LIMIT_REQUESTS,
            trust_forwarded_for: false,
            min_confidence: None,
            eager_init: true,
            init_policy: InitPolicy::BestEffort,
            audit_dir: PathBuf::from("results"),
            engine: EngineSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration: defaults, optional JSON file, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("OCR_CONFIG_PATH") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: ServerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("OCR_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("OCR_PORT") {
            self.port = port.parse().context("OCR_PORT must be a port number")?;
        }
        if let Ok(lang) = env::var("OCR_DEFAULT_LANGUAGE") {
            self.default_language = lang;
        }
        if let Ok(langs) = env::var("OCR_LANGUAGES") {
            self.supported_languages = parse_language_list(&langs);
        }
        if let Ok(size) = env::var("OCR_MAX_FILE_SIZE") {
            self.max_file_size = size
                .parse()
                .context("OCR_MAX_FILE_SIZE must be a byte count")?;
        }
        if let Ok(n) = env::var("OCR_RATE_LIMIT_REQUESTS") {
            self.rate_limit_requests = n
                .parse()
                .context("OCR_RATE_LIMIT_REQUESTS must be an integer")?;
        }
        if let Ok(secs) = env::var("OCR_RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit_window_secs = secs
                .parse()
                .context("OCR_RATE_LIMIT_WINDOW_SECS must be an integer")?;
        }
        if let Ok(flag) = env::var("OCR_TRUST_FORWARDED_FOR") {
            self.trust_forwarded_for = parse_bool(&flag)
                .context("OCR_TRUST_FORWARDED_FOR must be true or false")?;
        }
        if let Ok(floor) = env::var("OCR_MIN_CONFIDENCE") {
            self.min_confidence = Some(
                floor
                    .parse()
                    .context("OCR_MIN_CONFIDENCE must be a number")?,
            );
        }
        if let Ok(policy) = env::var("OCR_INIT_POLICY") {
            self.init_policy = InitPolicy::from_str(&policy)
                .with_context(|| format!("Unknown OCR_INIT_POLICY: {}", policy))?;
        }
        if let Ok(dir) = env::var("OCR_AUDIT_DIR") {
            self.audit_dir = PathBuf::from(dir);
        }
        if let Ok(url) = env::var("OCR_ENGINE_URL") {
            self.engine.sidecar_url = url;
        }
        if let Ok(secs) = env::var("OCR_ENGINE_TIMEOUT_SECS") {
            self.engine.recognize_timeout_secs = secs
                .parse()
                .context("OCR_ENGINE_TIMEOUT_SECS must be an integer")?;
        }
        Ok(())
    }

    /// Reject combinations the registry cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.supported_languages.is_empty() {
            anyhow::bail!("At least one supported language is required");
        }
        if !self.supported_languages.contains(&self.default_language) {
            anyhow::bail!(
                "Default language {} is not in supported languages {:?}",
                self.default_language,
                self.supported_languages
            );
        }
        if self.rate_limit_requests == 0 {
            anyhow::bail!("Rate limit must allow at least one request per window");
        }
        if let Some(floor) = self.min_confidence {
            if !(0.0..=1.0).contains(&floor) {
                anyhow::bail!("min_confidence must be within [0, 1], got {}", floor);
            }
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_language_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}
