//! Fingerprint cache: memoized answers to the three expensive branch
//! questions, keyed by the commits they were computed for.
//!
//! An answer is returned only when the branch and base shas match the ones
//! it was computed for. Storing a new pair for the same branch replaces the
//! old answer, so the store never grows past one entry per branch and
//! question.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintQuestion {
    BehindBase,
    Modified,
    Conflicted,
}

impl fmt::Display for FingerprintQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BehindBase => "behind-base",
            Self::Modified => "modified",
            Self::Conflicted => "conflicted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub question: FingerprintQuestion,
    pub branch: String,
    pub branch_sha: String,
    /// Empty for `Modified`.
    pub base: String,
    pub base_sha: String,
}

impl FingerprintKey {
    pub fn behind_base(branch: &str, branch_sha: &str, base: &str, base_sha: &str) -> Self {
        Self::with_base(FingerprintQuestion::BehindBase, branch, branch_sha, base, base_sha)
    }

    pub fn conflicted(branch: &str, branch_sha: &str, base: &str, base_sha: &str) -> Self {
        Self::with_base(FingerprintQuestion::Conflicted, branch, branch_sha, base, base_sha)
    }

    pub fn modified(branch: &str, branch_sha: &str) -> Self {
        Self::with_base(FingerprintQuestion::Modified, branch, branch_sha, "", "")
    }

    fn with_base(
        question: FingerprintQuestion,
        branch: &str,
        branch_sha: &str,
        base: &str,
        base_sha: &str,
    ) -> Self {
        Self {
            question,
            branch: branch.to_string(),
            branch_sha: branch_sha.to_string(),
            base: base.to_string(),
            base_sha: base_sha.to_string(),
        }
    }

    /// Storage slot: one per question and branch.
    fn slot(&self) -> String {
        format!("{}:{}", self.question, self.branch)
    }
}

/// Persisted answer together with the key it was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredAnswer {
    key: FingerprintKey,
    value: bool,
}

/// Storage port for cached answers.
pub trait FingerprintStore: Send + Sync {
    fn get(&self, key: &FingerprintKey) -> Option<bool>;
    fn set(&self, key: FingerprintKey, value: bool);
    /// Drop everything; used when the repository is reset.
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct InMemoryFingerprintStore {
    entries: Mutex<HashMap<String, StoredAnswer>>,
}

impl InMemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FingerprintStore for InMemoryFingerprintStore {
    fn get(&self, key: &FingerprintKey) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key.slot())
            .filter(|stored| &stored.key == key)
            .map(|stored| stored.value)
    }

    fn set(&self, key: FingerprintKey, value: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.slot(), StoredAnswer { key, value });
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// JSON file backed store, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileFingerprintStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredAnswer>>,
}

impl JsonFileFingerprintStore {
    /// Load `path` if present. A corrupt file is logged and ignored.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt fingerprint cache");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read fingerprint cache");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "Fingerprint cache loaded");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, StoredAnswer>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)
    }

    fn persist_logged(&self, entries: &BTreeMap<String, StoredAnswer>) {
        if let Err(e) = self.persist(entries) {
            warn!(path = %self.path.display(), error = %e, "Failed to write fingerprint cache");
        }
    }
}

impl FingerprintStore for JsonFileFingerprintStore {
    fn get(&self, key: &FingerprintKey) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key.slot())
            .filter(|stored| &stored.key == key)
            .map(|stored| stored.value)
    }

    fn set(&self, key: FingerprintKey, value: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let stored = StoredAnswer { key, value };
        if entries.get(&stored.key.slot()) == Some(&stored) {
            return;
        }
        entries.insert(stored.key.slot(), stored);
        self.persist_logged(&entries);
    }

    fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        self.persist_logged(&entries);
    }
}

/// Typed access to the three cached questions.
#[derive(Clone)]
pub struct FingerprintCache {
    store: Arc<dyn FingerprintStore>,
}

impl fmt::Debug for FingerprintCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintCache").finish_non_exhaustive()
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryFingerprintStore::new()))
    }

    pub fn behind_base(&self, branch: &str, branch_sha: &str, base: &str, base_sha: &str) -> Option<bool> {
        self.store
            .get(&FingerprintKey::behind_base(branch, branch_sha, base, base_sha))
    }

    pub fn set_behind_base(&self, branch: &str, branch_sha: &str, base: &str, base_sha: &str, value: bool) {
        self.store.set(
            FingerprintKey::behind_base(branch, branch_sha, base, base_sha),
            value,
        );
    }

    pub fn modified(&self, branch: &str, branch_sha: &str) -> Option<bool> {
        self.store.get(&FingerprintKey::modified(branch, branch_sha))
    }

    pub fn set_modified(&self, branch: &str, branch_sha: &str, value: bool) {
        self.store
            .set(FingerprintKey::modified(branch, branch_sha), value);
    }

    pub fn conflicted(&self, branch: &str, branch_sha: &str, base: &str, base_sha: &str) -> Option<bool> {
        self.store
            .get(&FingerprintKey::conflicted(branch, branch_sha, base, base_sha))
    }

    pub fn set_conflicted(&self, branch: &str, branch_sha: &str, base: &str, base_sha: &str, value: bool) {
        self.store.set(
            FingerprintKey::conflicted(branch, branch_sha, base, base_sha),
            value,
        );
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sha_mismatch_is_a_miss() {
        let cache = FingerprintCache::in_memory();
        cache.set_conflicted("upkeep/lodash", "b1", "main", "m1", true);

        assert_eq!(cache.conflicted("upkeep/lodash", "b1", "main", "m1"), Some(true));
        assert_eq!(cache.conflicted("upkeep/lodash", "b2", "main", "m1"), None);
        assert_eq!(cache.conflicted("upkeep/lodash", "b1", "main", "m2"), None);
        assert_eq!(cache.conflicted("upkeep/lodash", "b1", "dev", "m1"), None);
    }

    #[test]
    fn test_questions_are_independent() {
        let cache = FingerprintCache::in_memory();
        cache.set_behind_base("b", "s1", "main", "m1", true);
        assert_eq!(cache.conflicted("b", "s1", "main", "m1"), None);
        assert_eq!(cache.modified("b", "s1"), None);

        cache.set_modified("b", "s1", false);
        assert_eq!(cache.modified("b", "s1"), Some(false));
        assert_eq!(cache.behind_base("b", "s1", "main", "m1"), Some(true));
    }

    #[test]
    fn test_new_pair_replaces_old_entry() {
        let store = Arc::new(InMemoryFingerprintStore::new());
        let cache = FingerprintCache::new(store.clone());
        cache.set_behind_base("b", "s1", "main", "m1", false);
        cache.set_behind_base("b", "s1", "main", "m2", true);

        assert_eq!(store.len(), 1);
        assert_eq!(cache.behind_base("b", "s1", "main", "m1"), None);
        assert_eq!(cache.behind_base("b", "s1", "main", "m2"), Some(true));
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("fingerprints.json");

        let store = JsonFileFingerprintStore::open(&path);
        store.set(FingerprintKey::modified("b", "s1"), true);
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = JsonFileFingerprintStore::open(&path);
        assert_eq!(reopened.get(&FingerprintKey::modified("b", "s1")), Some(true));
        assert_eq!(reopened.get(&FingerprintKey::modified("b", "s2")), None);

        reopened.clear();
        let cleared = JsonFileFingerprintStore::open(&path);
        assert_eq!(cleared.get(&FingerprintKey::modified("b", "s1")), None);
    }

    #[test]
    fn test_json_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileFingerprintStore::open(&path);
        assert_eq!(store.get(&FingerprintKey::modified("b", "s1")), None);
        store.set(FingerprintKey::modified("b", "s1"), false);
        assert_eq!(
            JsonFileFingerprintStore::open(&path).get(&FingerprintKey::modified("b", "s1")),
            Some(false)
        );
    }

    proptest! {
        #[test]
        fn prop_cached_answer_only_for_exact_pair(
            branch_sha in "[0-9a-f]{8}",
            base_sha in "[0-9a-f]{8}",
            other_sha in "[0-9a-f]{8}",
            value: bool,
        ) {
            let cache = FingerprintCache::in_memory();
            cache.set_conflicted("b", &branch_sha, "main", &base_sha, value);
            prop_assert_eq!(cache.conflicted("b", &branch_sha, "main", &base_sha), Some(value));
            if other_sha != base_sha {
                prop_assert_eq!(cache.conflicted("b", &branch_sha, "main", &other_sha), None);
            }
            if other_sha != branch_sha {
                prop_assert_eq!(cache.conflicted("b", &other_sha, "main", &base_sha), None);
            }
        }
    }
}
