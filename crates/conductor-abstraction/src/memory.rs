//! In-process collaborator implementations.
//!
//! `MemoryStorage` backs tests and the CLI demo runtime; `RecordingNotifier`
//! captures escalations for assertions and `LogNotifier` forwards them to the
//! tracing log.

use crate::{
    NotificationError, NotificationPriority, Notifier, Record, RecordFilter, Storage, StorageError,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

type Collections = HashMap<String, BTreeMap<String, Record>>;

/// In-memory record store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    collections: Arc<RwLock<Collections>>,
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("collections", &self.collections.read().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record without conflict checks.
    ///
    /// Used to seed fixtures.
    pub fn seed(&self, collection: &str, id: &str, record: Record) {
        let mut collections = self.write();
        collections.entry(collection.to_string()).or_default().insert(id.to_string(), record);
    }

    /// Returns the number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.read().get(collection).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if the collection holds no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
        self.collections.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
        self.collections.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.read().get(collection).and_then(|records| records.get(id)).cloned())
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError> {
        Ok(self
            .read()
            .get(collection)
            .map(|records| records.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, id: &str, record: Record) -> Result<(), StorageError> {
        let mut collections = self.write();
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(id) {
            return Err(StorageError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        records.insert(id.to_string(), record);
        debug!(collection = %collection, id = %id, "Created record");
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Record) -> Result<Record, StorageError> {
        let mut collections = self.write();
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        match (record.as_object_mut(), patch) {
            (Some(existing), Value::Object(fields)) => existing.extend(fields),
            (_, replacement) => *record = replacement,
        }
        Ok(record.clone())
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    /// Priority the message was sent with.
    pub priority: NotificationPriority,
    /// Destination channel.
    pub channel: String,
    /// Message title.
    pub title: String,
    /// Message body.
    pub message: String,
}

/// Notifier that records every message it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    fail: bool,
}

impl RecordingNotifier {
    /// Creates a notifier that accepts every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a notifier that records messages and then reports a delivery failure.
    #[must_use]
    pub fn failing() -> Self {
        Self { sent: Arc::default(), fail: true }
    }

    /// Returns a copy of every message sent so far.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        priority: NotificationPriority,
        channel: &str,
        title: &str,
        message: &str,
    ) -> Result<(), NotificationError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                priority,
                channel: channel.to_string(),
                title: title.to_string(),
                message: message.to_string(),
            });
        }
        if self.fail {
            return Err(NotificationError::Delivery("recording notifier set to fail".to_string()));
        }
        Ok(())
    }
}

/// Notifier that writes every message to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        priority: NotificationPriority,
        channel: &str,
        title: &str,
        message: &str,
    ) -> Result<(), NotificationError> {
        match priority {
            NotificationPriority::Low => info!(channel = %channel, %priority, "{}: {}", title, message),
            NotificationPriority::High => warn!(channel = %channel, %priority, "{}: {}", title, message),
            NotificationPriority::Urgent => {
                error!(channel = %channel, %priority, "{}: {}", title, message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_find() {
        let storage = MemoryStorage::new();
        storage.create("inventory", "SKU-1", json!({"stock": 3})).await.unwrap();

        let found = storage.find_by_id("inventory", "SKU-1").await.unwrap();
        assert_eq!(found, Some(json!({"stock": 3})));
        assert_eq!(storage.find_by_id("inventory", "SKU-2").await.unwrap(), None);
        assert_eq!(storage.find_by_id("orders", "SKU-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let storage = MemoryStorage::new();
        storage.create("inventory", "SKU-1", json!({})).await.unwrap();

        let err = storage.create("inventory", "SKU-1", json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let storage = MemoryStorage::new();
        storage.seed("inventory", "SKU-1", json!({"stock": 3, "warehouse": "north"}));

        let updated = storage.update("inventory", "SKU-1", json!({"stock": 7})).await.unwrap();
        assert_eq!(updated, json!({"stock": 7, "warehouse": "north"}));

        let err = storage.update("inventory", "SKU-9", json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_many_with_filter() {
        let storage = MemoryStorage::new();
        storage.seed("inventory", "a", json!({"warehouse": "north"}));
        storage.seed("inventory", "b", json!({"warehouse": "south"}));
        storage.seed("inventory", "c", json!({"warehouse": "north"}));

        let north = storage
            .find_many("inventory", &RecordFilter::new().with_field("warehouse", "north"))
            .await
            .unwrap();
        assert_eq!(north.len(), 2);
        assert_eq!(storage.len("inventory"), 3);
        assert!(storage.is_empty("orders"));
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.send(NotificationPriority::High, "ops", "Title", "Body").await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "ops");
        assert_eq!(sent[0].priority, NotificationPriority::High);

        let failing = RecordingNotifier::failing();
        assert!(failing.send(NotificationPriority::Low, "ops", "t", "m").await.is_err());
        assert_eq!(failing.sent().len(), 1);
    }
}
