//! Conversation store: keyed conversation records plus the per-agent credential partition.
//!
//! Records live in memory behind a lock and are the source of truth. When a path is
//! configured, committed writes mark the store dirty and a flush task writes a JSON snapshot
//! of the whole store; the snapshot is loaded on start.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::conversation::{ConversationKey, ConversationRecord};
use crate::credentials::AgentCredentials;
use crate::error::ConversationError;

/// Minimal view of a record used by the inactivity sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub last_timestamp: i64,
    pub csat_sent: bool,
}

impl ConversationSummary {
    /// Whole minutes since the last inbound activity.
    pub fn idle_minutes(&self, now: i64) -> i64 {
        (now - self.last_timestamp).max(0) / 60
    }
}

/// On-disk snapshot layout.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    conversations: Vec<ConversationRecord>,
    #[serde(default)]
    credentials: HashMap<String, AgentCredentials>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    conversations: Vec<&'a ConversationRecord>,
    credentials: &'a HashMap<String, AgentCredentials>,
}

pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationKey, ConversationRecord>>,
    credentials: RwLock<HashMap<String, AgentCredentials>>,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Purely in-memory store (nothing persisted).
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            path: None,
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load store from a snapshot file; a missing file starts empty, an unreadable one is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConversationError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str::<Snapshot>(&s).map_err(|e| {
                ConversationError::Store(format!("parsing {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("store: no snapshot at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(e) => {
                return Err(ConversationError::Store(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let conversations = snapshot
            .conversations
            .into_iter()
            .map(|r| (r.key(), r))
            .collect::<HashMap<_, _>>();
        log::info!(
            "store: loaded {} conversation(s) from {}",
            conversations.len(),
            path.display()
        );
        Ok(Self {
            conversations: RwLock::new(conversations),
            credentials: RwLock::new(snapshot.credentials),
            path: Some(path),
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write the current state to the snapshot file (no-op for in-memory stores).
    pub async fn save(&self) -> Result<(), ConversationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        // Cleared before reading so writes that land during the snapshot keep the store dirty.
        self.dirty.store(false, Ordering::SeqCst);
        let json = {
            let conversations = self.conversations.read().await;
            let credentials = self.credentials.read().await;
            let mut records: Vec<&ConversationRecord> = conversations.values().collect();
            records.sort_by(|a, b| {
                (&a.agent_id, &a.conversation_id).cmp(&(&b.agent_id, &b.conversation_id))
            });
            serde_json::to_string_pretty(&SnapshotRef {
                conversations: records,
                credentials: &credentials,
            })
            .map_err(|e| ConversationError::Store(e.to_string()))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConversationError::Store(e.to_string()))?;
        }
        if let Err(e) = tokio::fs::write(path, json).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(ConversationError::Store(format!(
                "writing {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    /// True when committed writes have not reached the snapshot file yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Save only if something changed since the last successful save.
    pub async fn flush(&self) -> Result<(), ConversationError> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.save().await
    }

    /// Run [`flush`](Self::flush) every `interval` until the task is aborted.
    /// A failed flush keeps the store dirty and is retried on the next tick.
    pub fn spawn_flush(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        log::info!("store: flushing snapshot every {}s", interval.as_secs());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush().await {
                    log::warn!("store: snapshot flush failed: {}", e);
                }
            }
        })
    }

    fn mark_dirty(&self) {
        if self.path.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Return a clone of the record if it exists.
    pub async fn get(&self, key: &ConversationKey) -> Option<ConversationRecord> {
        self.conversations.read().await.get(key).cloned()
    }

    /// Atomic read-modify-write on one record.
    ///
    /// The closure runs against a copy under the write lock; the copy replaces the stored
    /// record only when the closure returns `Ok`, so a failed transition leaves no trace.
    /// Persistence is deferred to [`flush`](Self::flush): a committed change is never
    /// reported as an error because the disk is unavailable.
    pub async fn update<T, F>(&self, key: &ConversationKey, f: F) -> Result<T, ConversationError>
    where
        F: FnOnce(&mut ConversationRecord) -> Result<T, ConversationError>,
    {
        let out = {
            let mut g = self.conversations.write().await;
            let current = g
                .get(key)
                .ok_or_else(|| ConversationError::ConversationNotFound(key.to_string()))?;
            let mut next = current.clone();
            let out = f(&mut next)?;
            if next != *current {
                g.insert(key.clone(), next);
                self.mark_dirty();
            }
            out
        };
        Ok(out)
    }

    /// Like [`update`](Self::update), but creates the record first when it does not exist.
    /// The closure receives `true` when the record was just created.
    pub async fn upsert<T, F>(
        &self,
        key: &ConversationKey,
        display_name: &str,
        now: i64,
        f: F,
    ) -> Result<T, ConversationError>
    where
        F: FnOnce(&mut ConversationRecord, bool) -> Result<T, ConversationError>,
    {
        let out = {
            let mut g = self.conversations.write().await;
            let (mut next, created) = match g.get(key) {
                Some(r) => (r.clone(), false),
                None => (ConversationRecord::new(key, display_name, now), true),
            };
            let out = f(&mut next, created)?;
            g.insert(key.clone(), next);
            self.mark_dirty();
            out
        };
        Ok(out)
    }

    /// Point-in-time view of every conversation.
    pub async fn snapshot(&self) -> Vec<ConversationSummary> {
        self.conversations
            .read()
            .await
            .values()
            .map(|r| ConversationSummary {
                key: r.key(),
                last_timestamp: r.last_timestamp,
                csat_sent: r.csat_sent,
            })
            .collect()
    }

    pub async fn credentials(&self, agent_id: &str) -> Option<AgentCredentials> {
        self.credentials.read().await.get(agent_id).cloned()
    }

    /// Add or replace the credential record for an agent and persist.
    pub async fn put_credentials(
        &self,
        agent_id: impl Into<String>,
        credentials: AgentCredentials,
    ) -> Result<(), ConversationError> {
        self.credentials
            .write()
            .await
            .insert(agent_id.into(), credentials);
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{MessageInfo, Sender};

    fn key() -> ConversationKey {
        ConversationKey::new("agent-1", "conv-1")
    }

    #[test]
    fn idle_minutes_rounds_down() {
        let summary = ConversationSummary {
            key: key(),
            last_timestamp: 1_000,
            csat_sent: false,
        };
        assert_eq!(summary.idle_minutes(1_000 + 15 * 60 - 1), 14);
        assert_eq!(summary.idle_minutes(1_000 + 15 * 60), 15);
        assert_eq!(summary.idle_minutes(500), 0);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = ConversationStore::new();
        let err = store.update(&key(), |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, ConversationError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn failed_update_leaves_record_unchanged() {
        let store = ConversationStore::new();
        store
            .upsert(&key(), "Ada", 10, |r, _| r.accept_message_id("m-1"))
            .await
            .unwrap();
        let err = store
            .update(&key(), |r| {
                r.push_message(Sender::User, MessageInfo::default(), true, 11);
                r.accept_message_id("m-1")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::DuplicateMessage(_)));
        assert!(store.get(&key()).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_same_id_accept_once() {
        let store = Arc::new(ConversationStore::new());
        store.upsert(&key(), "Ada", 10, |_, _| Ok(())).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&key(), |r| {
                        r.accept_message_id("m-1")?;
                        r.push_message(Sender::User, MessageInfo::default(), true, 11);
                        Ok(())
                    })
                    .await
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(store.get(&key()).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_file_round_trips_records_and_credentials() {
        let path = std::env::temp_dir()
            .join(format!("handoff-store-test-{}", uuid::Uuid::new_v4()))
            .join("conversations.json");
        {
            let store = ConversationStore::load(&path).await.unwrap();
            store
                .upsert(&key(), "Ada", 10, |r, _| r.request_live_agent())
                .await
                .unwrap();
            store
                .put_credentials(
                    "agent-1",
                    AgentCredentials {
                        project_id: "proj".to_string(),
                        credentials: serde_json::json!({}),
                        survey_threshold: Some(serde_json::json!(30)),
                    },
                )
                .await
                .unwrap();
        }
        let reloaded = ConversationStore::load(&path).await.unwrap();
        let record = reloaded.get(&key()).await.unwrap();
        assert!(record.requested_live_agent());
        assert_eq!(record.display_name, "Ada");
        let creds = reloaded.credentials("agent-1").await.unwrap();
        assert_eq!(creds.project_id, "proj");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn unwritable_snapshot_does_not_lose_accepted_message() {
        let dir = std::env::temp_dir().join(format!("handoff-store-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("conversations.json");
        let store = ConversationStore::load(&path).await.unwrap();
        // A directory where the snapshot file should go makes every write fail.
        std::fs::create_dir_all(&path).unwrap();

        store
            .upsert(&key(), "Ada", 10, |r, _| {
                r.accept_message_id("m-1")?;
                r.push_message(Sender::User, MessageInfo::default(), true, 10);
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.is_dirty());
        assert!(store.flush().await.is_err());
        assert!(store.is_dirty());

        let record = store.get(&key()).await.unwrap();
        assert_eq!(record.messages.len(), 1);
        assert!(record.message_ids.contains("m-1"));

        // Once the disk recovers the pending state is written.
        std::fs::remove_dir_all(&path).unwrap();
        store.flush().await.unwrap();
        assert!(!store.is_dirty());
        let reloaded = ConversationStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get(&key()).await.unwrap().messages.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn flush_writes_only_when_dirty() {
        let dir = std::env::temp_dir().join(format!("handoff-store-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("conversations.json");
        let store = ConversationStore::load(&path).await.unwrap();
        store.flush().await.unwrap();
        assert!(!path.exists());

        store.upsert(&key(), "Ada", 10, |_, _| Ok(())).await.unwrap();
        store.flush().await.unwrap();
        assert!(path.exists());
        assert!(!store.is_dirty());

        // A rejected transition changes nothing and leaves nothing to flush.
        let _ = store.update(&key(), |r| r.leave()).await;
        assert!(!store.is_dirty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
