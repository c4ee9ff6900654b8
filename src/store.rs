use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Raw persistence for a single store document.
///
/// Implementations must replace the whole document on `store` so that a
/// concurrent reader observes either the previous or the next version.
pub trait CacheBackend {
    fn load(&self) -> Result<Option<String>, CacheError>;
    fn store(&self, contents: &str) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
    fn describe(&self) -> String;
}

impl<B: CacheBackend + ?Sized> CacheBackend for &B {
    fn load(&self) -> Result<Option<String>, CacheError> {
        (**self).load()
    }

    fn store(&self, contents: &str) -> Result<(), CacheError> {
        (**self).store(contents)
    }

    fn clear(&self) -> Result<(), CacheError> {
        (**self).clear()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CacheBackend for FileBackend {
    fn load(&self) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, contents: &str) -> Result<(), CacheError> {
        write_atomic(&self.path, contents)
    }

    fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    contents: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(raw: &str) -> Self {
        Self {
            contents: Mutex::new(Some(raw.to_string())),
        }
    }

    pub fn snapshot(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>, CacheError> {
        Ok(self.snapshot())
    }

    fn store(&self, contents: &str) -> Result<(), CacheError> {
        *self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(contents.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        *self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub fn write_atomic(path: &Path, contents: &str) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => return Err(CacheError::NoParent(path.display().to_string())),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord<T> {
    pub value: T,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument<T> {
    version: String,
    #[serde(default = "BTreeMap::new")]
    entries: BTreeMap<String, CacheRecord<T>>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: Option<String>,
}

pub enum TtlRule<T> {
    Fixed(Duration),
    PerValue(Box<dyn Fn(&T) -> Duration>),
    Never,
}

#[derive(Debug)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
    Expired,
    Unavailable(CacheError),
}

/// All entries live in one JSON document.
pub struct CacheStore<T, B = FileBackend> {
    backend: B,
    version: &'static str,
    ttl: TtlRule<T>,
    max_entries: usize,
}

impl<T, B> CacheStore<T, B>
where
    T: Serialize + DeserializeOwned + Clone,
    B: CacheBackend,
{
    pub fn new(backend: B, version: &'static str, ttl: TtlRule<T>, max_entries: usize) -> Self {
        Self {
            backend,
            version,
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn lookup(&self, key: &str) -> CacheLookup<T> {
        self.lookup_at(key, Utc::now())
    }

    pub fn lookup_at(&self, key: &str, now: DateTime<Utc>) -> CacheLookup<T> {
        let doc = match self.load_document() {
            Ok(doc) => doc,
            Err(err) => return CacheLookup::Unavailable(err),
        };
        match doc.entries.get(key) {
            None => CacheLookup::Miss,
            Some(record) if self.is_fresh(record, now.timestamp_millis()) => {
                CacheLookup::Hit(record.value.clone())
            }
            Some(_) => CacheLookup::Expired,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        match self.lookup_at(key, now) {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Unavailable(err) => {
                debug!(store = %self.backend.describe(), error = %err, "cache read treated as miss");
                None
            }
            CacheLookup::Miss | CacheLookup::Expired => None,
        }
    }

    pub fn put(&self, key: &str, value: T) {
        self.put_at(key, value, Utc::now());
    }

    pub fn put_at(&self, key: &str, value: T, now: DateTime<Utc>) {
        self.update_at(key, now, |_| value);
    }

    /// Read-modify-write of a single key. The closure receives the current
    /// value when it is still within its TTL.
    pub fn update_at<F>(&self, key: &str, now: DateTime<Utc>, update: F) -> T
    where
        F: FnOnce(Option<T>) -> T,
    {
        let now_ms = now.timestamp_millis();
        let mut doc = self.load_document().unwrap_or_else(|err| {
            debug!(store = %self.backend.describe(), error = %err, "starting cache from empty document");
            self.empty_document()
        });

        let current = doc
            .entries
            .get(key)
            .filter(|record| self.is_fresh(record, now_ms))
            .map(|record| record.value.clone());
        let value = update(current);

        self.prune(&mut doc, key, now_ms);
        doc.entries.insert(
            key.to_string(),
            CacheRecord {
                value: value.clone(),
                timestamp: now_ms,
            },
        );

        if let Err(err) = self.write_document(&doc) {
            warn!(store = %self.backend.describe(), error = %err, "failed to persist cache");
        }
        value
    }

    pub fn remove(&self, key: &str) {
        let Ok(mut doc) = self.load_document() else {
            return;
        };
        if doc.entries.remove(key).is_some()
            && let Err(err) = self.write_document(&doc)
        {
            warn!(store = %self.backend.describe(), error = %err, "failed to persist cache");
        }
    }

    /// Keys present in a readable document, expired or not.
    pub fn keys(&self) -> Vec<String> {
        self.load_document()
            .map(|doc| doc.entries.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Err(err) = self.backend.clear() {
            warn!(store = %self.backend.describe(), error = %err, "failed to clear cache");
        }
    }

    fn is_fresh(&self, record: &CacheRecord<T>, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(record.timestamp);
        let ttl = match &self.ttl {
            TtlRule::Never => return true,
            TtlRule::Fixed(ttl) => *ttl,
            TtlRule::PerValue(rule) => rule(&record.value),
        };
        i128::from(age_ms) < ttl.as_millis() as i128
    }

    fn prune(&self, doc: &mut StoreDocument<T>, keep: &str, now_ms: i64) {
        doc.entries
            .retain(|key, record| key == keep || self.is_fresh(record, now_ms));

        let slots = self.max_entries - 1;
        let others = doc.entries.keys().filter(|key| *key != keep).count();
        if others <= slots {
            return;
        }

        let mut candidates: Vec<(i64, String)> = doc
            .entries
            .iter()
            .filter(|(key, _)| *key != keep)
            .map(|(key, record)| (record.timestamp, key.clone()))
            .collect();
        candidates.sort();
        for (_, key) in candidates.into_iter().take(others - slots) {
            doc.entries.remove(&key);
        }
    }

    fn empty_document(&self) -> StoreDocument<T> {
        StoreDocument {
            version: self.version.to_string(),
            entries: BTreeMap::new(),
        }
    }

    fn load_document(&self) -> Result<StoreDocument<T>, CacheError> {
        let Some(raw) = self.backend.load()? else {
            return Ok(self.empty_document());
        };
        let header: VersionHeader = serde_json::from_str(&raw)?;
        if header.version.as_deref() != Some(self.version) {
            return Err(CacheError::VersionMismatch {
                found: header.version,
                expected: self.version,
            });
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_document(&self, doc: &StoreDocument<T>) -> Result<(), CacheError> {
        let data = serde_json::to_string_pretty(doc)?;
        self.backend.store(&data)
    }
}

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(ms: i64) -> DateTime<Utc> {
        millis_to_datetime(ms).expect("valid millis")
    }

    fn fixed_store(backend: &MemoryBackend, max: usize) -> CacheStore<String, &MemoryBackend> {
        CacheStore::new(
            backend,
            "1",
            TtlRule::Fixed(Duration::from_secs(60)),
            max,
        )
    }

    #[test]
    fn get_after_put_returns_value_until_ttl_elapses() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 10);

        store.put_at("repo", "main".to_string(), at(1_000));

        assert_eq!(store.get_at("repo", at(1_000)).as_deref(), Some("main"));
        assert_eq!(store.get_at("repo", at(60_999)).as_deref(), Some("main"));
        assert_eq!(store.get_at("repo", at(61_000)), None);
        assert!(matches!(
            store.lookup_at("repo", at(61_000)),
            CacheLookup::Expired
        ));
        // reads never delete
        assert_eq!(store.keys(), vec!["repo".to_string()]);
    }

    #[test]
    fn eviction_keeps_most_recent_entries() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 2);

        store.put_at("A", "a".to_string(), at(0));
        store.put_at("B", "b".to_string(), at(1));
        store.put_at("C", "c".to_string(), at(2));

        assert_eq!(store.keys(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn eviction_never_removes_the_inserted_key() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 1);

        store.put_at("new", "n".to_string(), at(0));
        store.put_at("newer", "m".to_string(), at(5));

        assert_eq!(store.keys(), vec!["newer".to_string()]);
        assert_eq!(store.get_at("newer", at(5)).as_deref(), Some("m"));
    }

    #[test]
    fn overwriting_existing_key_does_not_evict_others() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 2);

        store.put_at("A", "a".to_string(), at(0));
        store.put_at("B", "b".to_string(), at(1));
        store.put_at("A", "a2".to_string(), at(2));

        assert_eq!(store.keys(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(store.get_at("A", at(2)).as_deref(), Some("a2"));
    }

    #[test]
    fn put_prunes_expired_entries() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 10);

        store.put_at("old", "o".to_string(), at(0));
        store.put_at("fresh", "f".to_string(), at(120_000));

        assert_eq!(store.keys(), vec!["fresh".to_string()]);
    }

    #[test]
    fn version_mismatch_reads_as_unavailable_and_is_replaced_on_write() {
        let backend = MemoryBackend::with_contents(
            r#"{"version":"0","entries":{"repo":{"value":"stale","timestamp":0}}}"#,
        );
        let store = fixed_store(&backend, 10);

        assert!(matches!(
            store.lookup_at("repo", at(1)),
            CacheLookup::Unavailable(CacheError::VersionMismatch { .. })
        ));
        assert_eq!(store.get_at("repo", at(1)), None);

        store.put_at("other", "fresh".to_string(), at(2));
        assert_eq!(store.keys(), vec!["other".to_string()]);
        assert!(backend.snapshot().expect("contents").contains("\"version\": \"1\""));
    }

    #[test]
    fn garbage_document_is_a_miss_not_an_error() {
        let backend = MemoryBackend::with_contents("{not json");
        let store = fixed_store(&backend, 10);

        assert_eq!(store.get_at("repo", at(0)), None);
        store.put_at("repo", "ok".to_string(), at(0));
        assert_eq!(store.get_at("repo", at(0)).as_deref(), Some("ok"));
    }

    #[test]
    fn per_value_ttl_expires_failures_sooner() {
        fn ttl(value: &String) -> Duration {
            if value == "failed" {
                Duration::from_secs(15)
            } else {
                Duration::from_secs(60)
            }
        }
        let backend = MemoryBackend::new();
        let store: CacheStore<String, _> = CacheStore::new(&backend, "1", TtlRule::PerValue(Box::new(ttl)), 4);

        store.put_at("ok", "value".to_string(), at(0));
        store.put_at("bad", "failed".to_string(), at(0));

        assert!(store.get_at("ok", at(20_000)).is_some());
        assert!(store.get_at("bad", at(20_000)).is_none());
    }

    #[test]
    fn update_sees_current_value() {
        let backend = MemoryBackend::new();
        let store: CacheStore<u64, _> = CacheStore::new(&backend, "1", TtlRule::Never, 4);

        store.update_at("count", at(0), |current| current.unwrap_or(0) + 1);
        let value = store.update_at("count", at(10), |current| current.unwrap_or(0) + 1);

        assert_eq!(value, 2);
    }

    #[test]
    fn file_backend_roundtrip_and_clear() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested").join("git-cache.json");
        let store: CacheStore<String> = CacheStore::new(
            FileBackend::new(&path),
            "1",
            TtlRule::Fixed(Duration::from_secs(5)),
            50,
        );

        store.put_at("/repo", "main".to_string(), at(0));
        assert!(path.exists());
        assert_eq!(store.get_at("/repo", at(4_999)).as_deref(), Some("main"));

        // a second handle on the same file sees the same data
        let other: CacheStore<String> = CacheStore::new(
            FileBackend::new(&path),
            "1",
            TtlRule::Fixed(Duration::from_secs(5)),
            50,
        );
        assert_eq!(other.get_at("/repo", at(1)).as_deref(), Some("main"));

        store.clear();
        assert!(!path.exists());
        assert_eq!(other.get_at("/repo", at(1)), None);
        store.clear();
    }

    #[test]
    fn remove_deletes_single_key() {
        let backend = MemoryBackend::new();
        let store = fixed_store(&backend, 10);
        store.put_at("A", "a".to_string(), at(0));
        store.put_at("B", "b".to_string(), at(0));

        store.remove("A");

        assert_eq!(store.keys(), vec!["B".to_string()]);
    }
}
