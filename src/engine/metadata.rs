//! Best-effort engine metadata scraped from worker diagnostics.
//!
//! Workers print free-text banners on stderr while loading. A few of those
//! lines name the compute backend, the loaded model and the engine version.
//! The latest value seen per engine is kept for status reporting only; the
//! request path never reads it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::Regex;
use serde::Serialize;

const UNKNOWN: &str = "unknown";

/// Last-observed identity of one engine. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetadata {
    pub backend: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<u32>,
    pub engine_version: Option<String>,
}

impl EngineMetadata {
    pub fn is_empty(&self) -> bool {
        self.backend.is_none()
            && self.model_name.is_none()
            && self.model_version.is_none()
            && self.engine_version.is_none()
    }
}

impl fmt::Display for EngineMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self
            .model_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        write!(
            f,
            "backend={} model={} model_version={} engine={}",
            self.backend.as_deref().unwrap_or(UNKNOWN),
            self.model_name.as_deref().unwrap_or(UNKNOWN),
            version,
            self.engine_version.as_deref().unwrap_or(UNKNOWN),
        )
    }
}

struct Patterns {
    backend: Regex,
    labelled_backend: Regex,
    model_name: Regex,
    model_version: Regex,
    engine_version: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // "Cuda backend thread 0: Found GPU ..."
        backend: Regex::new(r"(?i)(?:^|[\s:])([\w\-\.]+)\s+backend\s+thread")
            .expect("valid backend pattern"),
        // "Backend: OpenCL thread 0"
        labelled_backend: Regex::new(r"(?i)backend:\s*(.+?)\s+thread")
            .expect("valid labelled backend pattern"),
        model_name: Regex::new(r"(?i)Model name:\s*([\w\-\.]+)\s*$").expect("valid model name pattern"),
        model_version: Regex::new(r"(?i)Model version\s*(\d+)").expect("valid model version pattern"),
        // The banner line is exactly "<Engine> vX.Y.Z", optionally after a log timestamp.
        engine_version: Regex::new(r"(?i)(?:^|:\s+)\w+ v(\d+\.\d+\.\d+)$")
            .expect("valid engine version pattern"),
    })
}

/// Apply the patterns to one diagnostic line. Returns true if anything matched.
pub fn scrape_line(metadata: &mut EngineMetadata, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }

    let p = patterns();
    let mut matched = false;

    let backend = p
        .backend
        .captures(line)
        .or_else(|| p.labelled_backend.captures(line))
        .map(|c| c[1].trim().to_string())
        .filter(|b| !b.is_empty());
    if let Some(backend) = backend {
        metadata.backend = Some(backend);
        matched = true;
    }
    if let Some(c) = p.model_name.captures(line) {
        metadata.model_name = Some(c[1].to_string());
        matched = true;
    }
    if let Some(version) = p
        .model_version
        .captures(line)
        .and_then(|c| c[1].parse::<u32>().ok())
    {
        metadata.model_version = Some(version);
        matched = true;
    }
    if let Some(c) = p.engine_version.captures(line) {
        metadata.engine_version = Some(c[1].to_string());
        matched = true;
    }

    matched
}

/// Per-engine metadata shared by all supervisors of a pool.
#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: RwLock<HashMap<String, EngineMetadata>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one diagnostic line for an engine. Never fails.
    pub fn observe(&self, engine: &str, line: &str) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.entry(engine.to_string()).or_default();
        scrape_line(entry, line)
    }

    /// Latest metadata for an engine; all fields unknown if nothing was seen.
    pub fn get(&self, engine: &str) -> EngineMetadata {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(engine).cloned().unwrap_or_default()
    }
}
