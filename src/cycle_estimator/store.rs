use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::SignalCyclePattern;
use crate::error::StorageError;

/// File name prefix for persisted patterns
pub const PATTERN_FILE_PREFIX: &str = "signal-phase-";
const PATTERN_FILE_SUFFIX: &str = ".json.gz";

/// Per-node pattern persistence
///
/// Callers treat every error as best-effort: the in-memory pattern stays
/// authoritative.
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn save(&self, pattern: &SignalCyclePattern) -> Result<(), StorageError>;

    async fn load(&self, node_id: &str) -> Result<Option<SignalCyclePattern>, StorageError>;

    async fn load_all(&self) -> Result<HashMap<String, SignalCyclePattern>, StorageError>;
}

/// Process-local store, used in tests and when no directory is configured
#[derive(Default)]
pub struct MemoryPatternStore {
    patterns: Mutex<HashMap<String, SignalCyclePattern>>,
}

impl MemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternStore for MemoryPatternStore {
    async fn save(&self, pattern: &SignalCyclePattern) -> Result<(), StorageError> {
        self.patterns
            .lock()
            .await
            .insert(pattern.node_id.clone(), pattern.clone());
        Ok(())
    }

    async fn load(&self, node_id: &str) -> Result<Option<SignalCyclePattern>, StorageError> {
        Ok(self.patterns.lock().await.get(node_id).cloned())
    }

    async fn load_all(&self) -> Result<HashMap<String, SignalCyclePattern>, StorageError> {
        Ok(self.patterns.lock().await.clone())
    }
}

/// Gzip-compressed JSON files, one per node
///
/// # File Format
/// `{dir}/signal-phase-{node id}.json.gz`, node id with anything outside
/// `[A-Za-z0-9._-]` replaced by `_`.
///
/// Blocking file I/O runs on the tokio blocking pool.
#[derive(Clone, Debug)]
pub struct FilePatternStore {
    dir: PathBuf,
}

impl FilePatternStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FilePatternStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pattern_path(&self, node_id: &str) -> PathBuf {
        let sanitised: String = node_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir
            .join(format!("{}{}{}", PATTERN_FILE_PREFIX, sanitised, PATTERN_FILE_SUFFIX))
    }
}

fn write_pattern(path: &Path, pattern: &SignalCyclePattern) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec(pattern)?;
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()?;
    Ok(())
}

fn read_pattern(path: &Path) -> Result<SignalCyclePattern, StorageError> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut json = String::new();
    decoder.read_to_string(&mut json)?;
    Ok(serde_json::from_str(&json)?)
}

fn read_all_patterns(dir: &Path) -> Result<HashMap<String, SignalCyclePattern>, StorageError> {
    let mut patterns = HashMap::new();
    if !dir.exists() {
        return Ok(patterns);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_pattern_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(PATTERN_FILE_PREFIX) && name.ends_with(PATTERN_FILE_SUFFIX))
            .unwrap_or(false);
        if !is_pattern_file {
            continue;
        }

        match read_pattern(&path) {
            Ok(pattern) => {
                patterns.insert(pattern.node_id.clone(), pattern);
            }
            Err(e) => log::warn!("Skipping unreadable pattern file {}: {}", path.display(), e),
        }
    }

    Ok(patterns)
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(format!("Storage task failed: {}", e)))?
}

#[async_trait]
impl PatternStore for FilePatternStore {
    async fn save(&self, pattern: &SignalCyclePattern) -> Result<(), StorageError> {
        let path = self.pattern_path(&pattern.node_id);
        let pattern = pattern.clone();
        blocking(move || write_pattern(&path, &pattern)).await
    }

    async fn load(&self, node_id: &str) -> Result<Option<SignalCyclePattern>, StorageError> {
        let path = self.pattern_path(node_id);
        blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            read_pattern(&path).map(Some)
        })
        .await
    }

    async fn load_all(&self) -> Result<HashMap<String, SignalCyclePattern>, StorageError> {
        let dir = self.dir.clone();
        blocking(move || read_all_patterns(&dir)).await
    }
}
