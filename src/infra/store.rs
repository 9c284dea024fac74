//! In-memory state store with best-effort JSON snapshot persistence.
//!
//! Holds pair metadata, the ordered scan set, subscription indices, chat
//! profiles and the cached snapshot per pair. A single lock covers all of
//! it, so every method is atomic from the caller's point of view.
//! Cached fetch snapshots are never persisted.

use crate::domain::{
    CachedSnapshot, ChatId, ChatProfile, Clock, PairMetadata, Payload, SnapshotStatus,
    SystemClock,
};
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A chat's explicit subscriptions and whether it follows the whole scan set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserSubscriptions {
    pub all: bool,
    pub explicit: Vec<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    scan_set: Vec<String>,
    pair_meta: BTreeMap<String, PairMetadata>,
    subs_by_pair: BTreeMap<String, BTreeSet<ChatId>>,
    subs_all: BTreeSet<ChatId>,
    subs_by_user: BTreeMap<ChatId, BTreeSet<String>>,
    profiles: BTreeMap<ChatId, ChatProfile>,
    snapshots: HashMap<String, Arc<CachedSnapshot>>,
}

/// On-disk document. Map keys for chat ids serialise as strings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    scan_set: Vec<String>,
    #[serde(default)]
    pair_meta: Vec<PairMetadata>,
    #[serde(default)]
    subs_by_pair: BTreeMap<String, BTreeSet<ChatId>>,
    #[serde(default)]
    subs_all: BTreeSet<ChatId>,
    #[serde(default)]
    subs_by_user: BTreeMap<ChatId, BTreeSet<String>>,
    #[serde(default)]
    profiles: BTreeMap<ChatId, ChatProfile>,
}

impl From<&StoreInner> for PersistedState {
    fn from(inner: &StoreInner) -> Self {
        Self {
            scan_set: inner.scan_set.clone(),
            pair_meta: inner.pair_meta.values().cloned().collect(),
            subs_by_pair: inner.subs_by_pair.clone(),
            subs_all: inner.subs_all.clone(),
            subs_by_user: inner.subs_by_user.clone(),
            profiles: inner.profiles.clone(),
        }
    }
}

/// Single source of truth shared by the scheduler, cache and command handlers
pub struct StateStore {
    inner: RwLock<StoreInner>,
    snapshot_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Create an empty store; `snapshot_path` enables persistence
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self::with_clock(snapshot_path, Arc::new(SystemClock))
    }

    pub fn with_clock(snapshot_path: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            snapshot_path,
            clock,
        }
    }

    /// Clock used to timestamp cached snapshots
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    // ==================== Persistence ====================

    /// Load the on-disk snapshot, replacing in-memory state.
    ///
    /// Returns `true` when a snapshot was applied. Missing or unreadable
    /// files leave the store untouched.
    pub async fn load_snapshot(&self) -> bool {
        let Some(path) = self.snapshot_path.as_ref() else {
            return false;
        };

        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store snapshot at {}", path.display());
                return false;
            }
            Err(e) => {
                warn!("Failed to read store snapshot {}: {}", path.display(), e);
                return false;
            }
        };

        let persisted: PersistedState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring malformed store snapshot {}: {}", path.display(), e);
                return false;
            }
        };

        let mut inner = self.inner.write().await;
        inner.scan_set = persisted.scan_set;
        inner.pair_meta = persisted
            .pair_meta
            .into_iter()
            .filter(|meta| !meta.pair_key.is_empty())
            .map(|meta| (meta.pair_key.clone(), meta.normalized()))
            .collect();
        inner.subs_by_pair = persisted.subs_by_pair;
        inner.subs_all = persisted.subs_all;
        inner.subs_by_user = persisted.subs_by_user;
        inner.profiles = persisted.profiles;
        inner.snapshots.clear();

        info!(
            "Loaded store snapshot: {} pairs, {} in scan set, {} global subscribers",
            inner.pair_meta.len(),
            inner.scan_set.len(),
            inner.subs_all.len()
        );
        true
    }

    /// Write the durable part of the state. Failures are logged, not raised.
    async fn persist_locked(&self, inner: &StoreInner) {
        let Some(path) = self.snapshot_path.as_ref() else {
            return;
        };
        if let Err(e) = write_snapshot(path, &PersistedState::from(inner)).await {
            warn!("{}", e);
        }
    }

    // ==================== Pairs & scan set ====================

    /// Upsert all pairs and seed or top up the scan set to `scan_size`.
    ///
    /// Existing scan-set members that still have metadata keep their order;
    /// new keys are appended in input order until the cap is reached.
    pub async fn initialize_pairs(&self, pairs: &[PairMetadata], scan_size: usize) {
        let mut inner = self.inner.write().await;
        for meta in pairs {
            inner
                .pair_meta
                .insert(meta.pair_key.clone(), meta.clone().normalized());
        }

        let existing: Vec<String> = inner
            .scan_set
            .iter()
            .filter(|key| inner.pair_meta.contains_key(*key))
            .cloned()
            .collect();

        if existing.is_empty() {
            let mut seeded = Vec::new();
            for meta in pairs {
                if seeded.len() >= scan_size {
                    break;
                }
                if !seeded.contains(&meta.pair_key) {
                    seeded.push(meta.pair_key.clone());
                }
            }
            inner.scan_set = seeded;
        } else {
            let mut scan_set = existing;
            for meta in pairs {
                if scan_set.len() >= scan_size {
                    break;
                }
                if !scan_set.contains(&meta.pair_key) {
                    scan_set.push(meta.pair_key.clone());
                }
            }
            inner.scan_set = scan_set;
        }

        let StoreInner {
            pair_meta,
            subs_by_pair,
            ..
        } = &mut *inner;
        subs_by_pair.retain(|key, _| pair_meta.contains_key(key));

        debug!(
            "Initialised {} pairs, scan set: {:?}",
            pairs.len(),
            inner.scan_set
        );
        self.persist_locked(&inner).await;
    }

    /// Replace the scan set atomically.
    ///
    /// Returns `(removed, added)`. Any unknown key fails the whole call and
    /// leaves the current scan set unchanged.
    pub async fn set_scan_set(
        &self,
        keys: &[String],
    ) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut inner = self.inner.write().await;
        if let Some(unknown) = keys.iter().find(|k| !inner.pair_meta.contains_key(*k)) {
            return Err(ScanError::UnknownPairKey(unknown.clone()));
        }

        let mut incoming: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            if !incoming.contains(key) {
                incoming.push(key.clone());
            }
        }

        let current: BTreeSet<String> = inner.scan_set.iter().cloned().collect();
        let next: BTreeSet<String> = incoming.iter().cloned().collect();
        let removed = current.difference(&next).cloned().collect();
        let added = next.difference(&current).cloned().collect();

        inner.scan_set = incoming;
        self.persist_locked(&inner).await;
        Ok((removed, added))
    }

    /// Append a known pair to the scan set if absent; returns whether it was added.
    ///
    /// Fails with `ScanSetFull` when the set already holds `max_len` keys.
    pub async fn ensure_pair_in_scan_set(&self, pair_key: &str, max_len: usize) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.pair_meta.contains_key(pair_key) {
            return Err(ScanError::UnknownPairKey(pair_key.to_string()));
        }
        if inner.scan_set.iter().any(|k| k == pair_key) {
            return Ok(false);
        }
        if inner.scan_set.len() >= max_len {
            return Err(ScanError::ScanSetFull(max_len));
        }
        inner.scan_set.push(pair_key.to_string());
        self.persist_locked(&inner).await;
        Ok(true)
    }

    pub async fn get_scan_set(&self) -> Vec<String> {
        self.inner.read().await.scan_set.clone()
    }

    pub async fn upsert_pair_metadata(&self, metadata: PairMetadata) {
        let mut inner = self.inner.write().await;
        inner
            .pair_meta
            .insert(metadata.pair_key.clone(), metadata.normalized());
        self.persist_locked(&inner).await;
    }

    pub async fn get_pair_metadata(&self, pair_key: &str) -> Option<PairMetadata> {
        self.inner.read().await.pair_meta.get(pair_key).cloned()
    }

    /// All known pairs, ordered by key
    pub async fn list_pair_metadata(&self) -> Vec<PairMetadata> {
        self.inner.read().await.pair_meta.values().cloned().collect()
    }

    /// Forget a pair entirely: metadata, scan-set slot, subscriptions and cache.
    ///
    /// Returns `false` when the key was not known.
    pub async fn remove_pair(&self, pair_key: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.pair_meta.remove(pair_key).is_none() {
            return false;
        }
        inner.scan_set.retain(|k| k != pair_key);
        if let Some(chats) = inner.subs_by_pair.remove(pair_key) {
            for chat in chats {
                remove_user_pair(&mut inner.subs_by_user, chat, pair_key);
            }
        }
        inner.snapshots.remove(pair_key);
        info!("Removed pair {}", pair_key);
        self.persist_locked(&inner).await;
        true
    }

    // ==================== Subscriptions ====================

    pub async fn subscribe_pair(&self, chat_id: ChatId, pair_key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.pair_meta.contains_key(pair_key) {
            return Err(ScanError::UnknownPairKey(pair_key.to_string()));
        }
        inner
            .subs_by_pair
            .entry(pair_key.to_string())
            .or_default()
            .insert(chat_id);
        inner
            .subs_by_user
            .entry(chat_id)
            .or_default()
            .insert(pair_key.to_string());
        self.persist_locked(&inner).await;
        Ok(())
    }

    pub async fn unsubscribe_pair(&self, chat_id: ChatId, pair_key: &str) {
        let mut inner = self.inner.write().await;
        if let Some(chats) = inner.subs_by_pair.get_mut(pair_key) {
            chats.remove(&chat_id);
            if chats.is_empty() {
                inner.subs_by_pair.remove(pair_key);
            }
        }
        remove_user_pair(&mut inner.subs_by_user, chat_id, pair_key);
        self.persist_locked(&inner).await;
    }

    pub async fn subscribe_all(&self, chat_id: ChatId) {
        let mut inner = self.inner.write().await;
        inner.subs_all.insert(chat_id);
        self.persist_locked(&inner).await;
    }

    pub async fn unsubscribe_all(&self, chat_id: ChatId) {
        let mut inner = self.inner.write().await;
        inner.subs_all.remove(&chat_id);
        self.persist_locked(&inner).await;
    }

    pub async fn list_user_subscriptions(&self, chat_id: ChatId) -> UserSubscriptions {
        let inner = self.inner.read().await;
        UserSubscriptions {
            all: inner.subs_all.contains(&chat_id),
            explicit: inner
                .subs_by_user
                .get(&chat_id)
                .map(|pairs| pairs.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Explicit plus global subscribers, deduplicated and sorted
    pub async fn list_pair_subscribers(&self, pair_key: &str) -> Vec<ChatId> {
        let inner = self.inner.read().await;
        subscribers_locked(&inner, pair_key)
    }

    /// Explicit subscriptions plus, for global subscribers, the current scan set
    pub async fn get_effective_subscriptions(&self, chat_id: ChatId) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut pairs: BTreeSet<String> = inner
            .subs_by_user
            .get(&chat_id)
            .cloned()
            .unwrap_or_default();
        if inner.subs_all.contains(&chat_id) {
            pairs.extend(inner.scan_set.iter().cloned());
        }
        pairs.into_iter().collect()
    }

    pub async fn list_subscribers_for_scan_set(&self) -> BTreeMap<String, Vec<ChatId>> {
        let inner = self.inner.read().await;
        inner
            .scan_set
            .iter()
            .map(|key| (key.clone(), subscribers_locked(&inner, key)))
            .collect()
    }

    // ==================== Profiles ====================

    pub async fn record_profile(&self, chat_id: ChatId, profile: ChatProfile) {
        let mut inner = self.inner.write().await;
        inner.profiles.insert(chat_id, profile);
        self.persist_locked(&inner).await;
    }

    /// Stored overrides for a chat; an empty profile reads as `None`
    pub async fn get_profile(&self, chat_id: ChatId) -> Option<ChatProfile> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .get(&chat_id)
            .filter(|profile| !profile.is_empty())
            .cloned()
    }

    // ==================== Cached snapshots ====================

    /// Overwrite the cached snapshot for a pair, stamped with the store clock
    pub async fn set_swr_snapshot(
        &self,
        pair_key: &str,
        payload: Payload,
        ttl: Duration,
        status: SnapshotStatus,
    ) -> Arc<CachedSnapshot> {
        let snapshot = Arc::new(CachedSnapshot {
            pair_key: pair_key.to_string(),
            payload,
            captured_at: self.clock.now(),
            ttl,
            status,
        });
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .insert(pair_key.to_string(), Arc::clone(&snapshot));
        snapshot
    }

    pub async fn get_swr_snapshot(&self, pair_key: &str) -> Option<Arc<CachedSnapshot>> {
        self.inner.read().await.snapshots.get(pair_key).cloned()
    }

    pub async fn remove_swr_snapshot(&self, pair_key: &str) {
        self.inner.write().await.snapshots.remove(pair_key);
    }
}

fn subscribers_locked(inner: &StoreInner, pair_key: &str) -> Vec<ChatId> {
    let mut chats: BTreeSet<ChatId> = inner
        .subs_by_pair
        .get(pair_key)
        .cloned()
        .unwrap_or_default();
    chats.extend(inner.subs_all.iter().copied());
    chats.into_iter().collect()
}

fn remove_user_pair(
    subs_by_user: &mut BTreeMap<ChatId, BTreeSet<String>>,
    chat_id: ChatId,
    pair_key: &str,
) {
    if let Some(pairs) = subs_by_user.get_mut(&chat_id) {
        pairs.remove(pair_key);
        if pairs.is_empty() {
            subs_by_user.remove(&chat_id);
        }
    }
}

/// Serialise to `<path>.tmp` and rename into place
async fn write_snapshot(path: &Path, state: &PersistedState) -> Result<()> {
    let body = serde_json::to_vec_pretty(state)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ScanError::Persistence(format!(
                "Failed to create snapshot directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, body).await.map_err(|e| {
        ScanError::Persistence(format!(
            "Failed to write store snapshot {}: {}",
            tmp_path.display(),
            e
        ))
    })?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
        ScanError::Persistence(format!(
            "Failed to move store snapshot into {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(key: &str, symbols: &str) -> PairMetadata {
        PairMetadata::new(key, symbols)
            .with_addresses("0x1", "0x2")
            .with_dex("dex")
            .with_fee_tiers(["0.05"])
    }

    fn two_pairs() -> Vec<PairMetadata> {
        vec![
            pair("base:pair1", "PAIR1/USDC"),
            pair("base:pair2", "PAIR2/USDC"),
        ]
    }

    #[tokio::test]
    async fn test_initialize_pairs_and_subscriptions() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 1).await;
        assert_eq!(store.get_scan_set().await, vec!["base:pair1"]);

        store.subscribe_pair(123, "base:pair1").await.unwrap();
        let subs = store.list_user_subscriptions(123).await;
        assert!(!subs.all);
        assert_eq!(subs.explicit, vec!["base:pair1"]);
        assert_eq!(store.list_pair_subscribers("base:pair1").await, vec![123]);

        store.subscribe_all(999).await;
        assert_eq!(
            store.list_pair_subscribers("base:pair1").await,
            vec![123, 999]
        );

        store.unsubscribe_pair(123, "base:pair1").await;
        assert_eq!(store.list_pair_subscribers("base:pair1").await, vec![999]);
        assert!(store.list_user_subscriptions(123).await.explicit.is_empty());

        let (removed, added) = store
            .set_scan_set(&["base:pair1".to_string(), "base:pair2".to_string()])
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert_eq!(added, BTreeSet::from(["base:pair2".to_string()]));
    }

    #[tokio::test]
    async fn test_initialize_preserves_existing_scan() {
        let store = StateStore::new(None);
        store
            .initialize_pairs(&[pair("base:pair1", "PAIR1/USDC")], 1)
            .await;
        store
            .set_scan_set(&["base:pair1".to_string()])
            .await
            .unwrap();
        store
            .initialize_pairs(&[pair("base:pair2", "PAIR2/USDC")], 1)
            .await;
        assert_eq!(store.get_scan_set().await, vec!["base:pair1"]);

        // Room to grow: new pairs are appended up to the cap
        store.initialize_pairs(&two_pairs(), 2).await;
        assert_eq!(store.get_scan_set().await, vec!["base:pair1", "base:pair2"]);

        // Idempotent under repeated calls
        store.initialize_pairs(&two_pairs(), 2).await;
        assert_eq!(store.get_scan_set().await, vec!["base:pair1", "base:pair2"]);
    }

    #[tokio::test]
    async fn test_set_scan_set_unknown_key_is_atomic() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 1).await;

        let err = store
            .set_scan_set(&["base:pair2".to_string(), "base:nope".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::UnknownPairKey(ref k) if k == "base:nope"));
        assert_eq!(store.get_scan_set().await, vec!["base:pair1"]);
    }

    #[tokio::test]
    async fn test_set_scan_set_reports_symmetric_difference() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 1).await;

        let (removed, added) = store
            .set_scan_set(&["base:pair2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, BTreeSet::from(["base:pair1".to_string()]));
        assert_eq!(added, BTreeSet::from(["base:pair2".to_string()]));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_pair_fails() {
        let store = StateStore::new(None);
        let err = store.subscribe_pair(1, "missing").await.unwrap_err();
        assert!(matches!(err, ScanError::UnknownPairKey(_)));
        assert!(store.list_user_subscriptions(1).await.explicit.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_union_has_no_duplicates() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 2).await;
        store.subscribe_pair(42, "base:pair1").await.unwrap();
        store.subscribe_all(42).await;
        store.subscribe_all(7).await;

        assert_eq!(store.list_pair_subscribers("base:pair1").await, vec![7, 42]);
    }

    #[tokio::test]
    async fn test_effective_subscriptions_union() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 1).await;
        store.subscribe_pair(5, "base:pair2").await.unwrap();
        assert_eq!(store.get_effective_subscriptions(5).await, vec!["base:pair2"]);

        store.subscribe_all(5).await;
        assert_eq!(
            store.get_effective_subscriptions(5).await,
            vec!["base:pair1", "base:pair2"]
        );

        let by_pair = store.list_subscribers_for_scan_set().await;
        assert_eq!(by_pair.get("base:pair1"), Some(&vec![5]));
        assert!(!by_pair.contains_key("base:pair2"));
    }

    #[tokio::test]
    async fn test_remove_pair_drops_subscriptions() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 2).await;
        store.subscribe_pair(9, "base:pair2").await.unwrap();

        assert!(store.remove_pair("base:pair2").await);
        assert!(!store.remove_pair("base:pair2").await);
        assert_eq!(store.get_scan_set().await, vec!["base:pair1"]);
        assert!(store.list_user_subscriptions(9).await.explicit.is_empty());

        // Re-adding restores nothing
        store.upsert_pair_metadata(pair("base:pair2", "PAIR2/USDC")).await;
        assert!(store.list_pair_subscribers("base:pair2").await.is_empty());
        assert!(store.ensure_pair_in_scan_set("base:pair2", 2).await.unwrap());
        assert!(!store.ensure_pair_in_scan_set("base:pair2", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_pair_respects_scan_set_cap() {
        let store = StateStore::new(None);
        store.initialize_pairs(&two_pairs(), 1).await;

        let err = store
            .ensure_pair_in_scan_set("base:pair2", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ScanSetFull(1)));
        assert_eq!(store.get_scan_set().await, vec!["base:pair1"]);

        // A member already present is reported, not rejected
        assert!(!store.ensure_pair_in_scan_set("base:pair1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_profiles() {
        let store = StateStore::new(None);
        assert!(store.get_profile(1).await.is_none());

        let mut profile = ChatProfile::new();
        profile.insert("min_net_bps".to_string(), json!(12.5));
        store.record_profile(1, profile.clone()).await;
        assert_eq!(store.get_profile(1).await, Some(profile));

        store.record_profile(1, ChatProfile::new()).await;
        assert!(store.get_profile(1).await.is_none());
    }

    #[tokio::test]
    async fn test_swr_snapshot_slot() {
        let store = StateStore::new(None);
        let mut payload = Payload::new();
        payload.insert("price".to_string(), json!(1.0));

        let stored = store
            .set_swr_snapshot(
                "base:pair1",
                payload.clone(),
                Duration::from_secs(15),
                SnapshotStatus::Fresh,
            )
            .await;
        let read = store.get_swr_snapshot("base:pair1").await.unwrap();
        assert_eq!(read, stored);
        assert_eq!(read.payload, payload);

        store.remove_swr_snapshot("base:pair1").await;
        assert!(store.get_swr_snapshot("base:pair1").await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_excludes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store_snapshot.json");

        let store = StateStore::new(Some(path.clone()));
        store.initialize_pairs(&two_pairs(), 1).await;
        store.subscribe_pair(42, "base:pair1").await.unwrap();
        store.subscribe_all(7).await;
        let mut profile = ChatProfile::new();
        profile.insert("test_size_eur".to_string(), json!(500));
        store.record_profile(42, profile.clone()).await;
        store
            .set_swr_snapshot(
                "base:pair1",
                Payload::new(),
                Duration::from_secs(15),
                SnapshotStatus::Fresh,
            )
            .await;
        assert!(path.exists());

        let restored = StateStore::new(Some(path.clone()));
        assert!(restored.load_snapshot().await);
        assert_eq!(restored.get_scan_set().await, vec!["base:pair1"]);
        assert_eq!(restored.list_pair_metadata().await, two_pairs());
        assert_eq!(
            restored.list_pair_subscribers("base:pair1").await,
            vec![7, 42]
        );
        assert_eq!(restored.get_profile(42).await, Some(profile));
        assert!(restored.get_swr_snapshot("base:pair1").await.is_none());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["subs_by_user"]["42"], json!(["base:pair1"]));
        assert_eq!(raw["subs_all"], json!([7]));
    }

    #[tokio::test]
    async fn test_load_snapshot_tolerates_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store_snapshot.json");

        let store = StateStore::new(Some(path.clone()));
        assert!(!store.load_snapshot().await);

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(!store.load_snapshot().await);
        assert!(store.get_scan_set().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let store = StateStore::new(Some(blocker.join("store_snapshot.json")));
        store.initialize_pairs(&two_pairs(), 1).await;
        store.subscribe_pair(1, "base:pair1").await.unwrap();
        assert_eq!(store.list_pair_subscribers("base:pair1").await, vec![1]);
    }
}
