//! Per-language engine registry.
//!
//! Engines are built once (eagerly at startup or on the first request) and
//! shared read-only by every request afterwards. Initialization is serialized
//! through a `OnceCell`; a failed attempt leaves the cell empty so a later call
//! can retry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{OnceCell, Semaphore};
use tracing::{error, info, warn};

use super::{EngineError, EngineFactory, OcrEngine, RawResult};
use crate::config::{EngineSettings, InitPolicy, ServerConfig};

#[derive(Clone)]
struct EngineSlot {
    engine: Arc<dyn OcrEngine>,
    permits: Option<Arc<Semaphore>>,
}

/// An engine handed out for one request.
#[derive(Clone)]
pub struct ResolvedEngine {
    /// The language actually served, after fallback.
    pub language: String,
    slot: EngineSlot,
}

pub struct EngineRegistry {
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    languages: Vec<String>,
    default_language: String,
    policy: InitPolicy,
    engines: OnceCell<HashMap<String, EngineSlot>>,
}

impl EngineRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, config: &ServerConfig) -> Self {
        Self {
            factory,
            settings: config.engine.clone(),
            languages: config.supported_languages.clone(),
            default_language: config.default_language.clone(),
            policy: config.init_policy,
            engines: OnceCell::new(),
        }
    }

    /// Load every supported language. Returns `true` once at least one engine
    /// is available (or all of them, under [`InitPolicy::AllOrNothing`]).
    ///
    /// Calling this again after success is a no-op.
    pub async fn initialize(&self) -> bool {
        match self.engines.get_or_try_init(|| self.load_all()).await {
            Ok(_) => true,
            Err(e) => {
                error!("Engine initialization failed: {:#}", e);
                false
            }
        }
    }

    async fn load_all(&self) -> anyhow::Result<HashMap<String, EngineSlot>> {
        info!(
            "Initializing {} engines for {:?} (policy {:?})",
            self.factory.name(),
            self.languages,
            self.policy
        );

        let mut engines = HashMap::new();
        for lang in &self.languages {
            match self.factory.build(lang, &self.settings).await {
                Ok(engine) => {
                    info!("Engine ready for {}", engine.language());
                    let permits = self
                        .settings
                        .max_concurrent_calls
                        .map(|n| Arc::new(Semaphore::new(n.max(1))));
                    engines.insert(lang.clone(), EngineSlot { engine, permits });
                }
                Err(e) => match self.policy {
                    InitPolicy::BestEffort => {
                        warn!("Failed to load engine for {}: {:#}", lang, e);
                    }
                    InitPolicy::AllOrNothing => {
                        return Err(e.context(format!("Failed to load engine for {}", lang)));
                    }
                },
            }
        }

        if engines.is_empty() {
            anyhow::bail!("No OCR engine could be loaded");
        }
        Ok(engines)
    }

    pub fn is_ready(&self) -> bool {
        self.engines.initialized()
    }

    /// Loaded languages, in configured order.
    pub fn loaded_languages(&self) -> Vec<String> {
        match self.engines.get() {
            Some(engines) => self
                .languages
                .iter()
                .filter(|l| engines.contains_key(*l))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn supported_languages(&self) -> &[String] {
        &self.languages
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Pick the engine for `language`, falling back to the default language.
    ///
    /// Triggers initialization if it has not succeeded yet.
    pub async fn resolve(&self, language: Option<&str>) -> Result<ResolvedEngine, EngineError> {
        if !self.is_ready() && !self.initialize().await {
            return Err(EngineError::Unavailable);
        }
        let engines = self.engines.get().ok_or(EngineError::Unavailable)?;

        let requested = language
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.default_language.clone());

        if let Some(slot) = engines.get(&requested) {
            return Ok(ResolvedEngine {
                language: requested,
                slot: slot.clone(),
            });
        }

        warn!(
            "Language {} not available, using {}",
            requested, self.default_language
        );
        engines
            .get(&self.default_language)
            .map(|slot| ResolvedEngine {
                language: self.default_language.clone(),
                slot: slot.clone(),
            })
            .ok_or(EngineError::Unavailable)
    }

    /// Run recognition with angle correction under the configured deadline.
    pub async fn recognize(
        &self,
        resolved: &ResolvedEngine,
        file_path: &Path,
    ) -> Result<RawResult, EngineError> {
        let _permit = match &resolved.slot.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Unavailable)?,
            ),
            None => None,
        };

        let timeout = self.settings.recognize_timeout();
        match tokio::time::timeout(timeout, resolved.slot.engine.recognize(file_path, true)).await {
            Ok(result) => result.map_err(EngineError::Failed),
            Err(_) => Err(EngineError::Timeout(timeout.as_secs())),
        }
    }
}
