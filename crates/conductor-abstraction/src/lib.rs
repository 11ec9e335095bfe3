//! Collaborator abstraction layer for Conductor.
//!
//! This module defines the traits and types the orchestration core uses to talk
//! to the outside world: a record-oriented storage collaborator and a
//! priority-tagged notification sink.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub use memory::{LogNotifier, MemoryStorage, RecordingNotifier, SentNotification};

/// A stored record. Records are schemaless JSON objects.
pub type Record = Value;

/// Represents an error that can occur when talking to the storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("Record '{id}' not found in '{collection}'")]
    NotFound {
        /// Collection that was searched.
        collection: String,
        /// Record ID that was requested.
        id: String,
    },

    /// A record with the same ID already exists.
    #[error("Record '{id}' already exists in '{collection}'")]
    Conflict {
        /// Collection the record was written to.
        collection: String,
        /// Conflicting record ID.
        id: String,
    },

    /// The store could not be reached or timed out.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The record could not be encoded or decoded.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// Other unexpected errors.
    #[error("Other Storage Error: {0}")]
    Other(String),
}

impl StorageError {
    /// Returns `true` for failures that may succeed when retried (network or
    /// availability hiccups).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Equality filter used by [`Storage::find_many`].
///
/// A record matches when every field in the filter is present in the record
/// with an equal value. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Field name to expected value.
    pub fields: Map<String, Value>,
}

impl RecordFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field equality constraint.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Checks whether a record satisfies the filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.fields.iter().all(|(field, expected)| record.get(field) == Some(expected))
    }
}

/// Record-oriented storage collaborator.
///
/// Every call may fail; callers must inspect the error before trusting the
/// returned data.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Finds a single record by ID.
    ///
    /// Returns `Ok(None)` when the record does not exist.
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>, StorageError>;

    /// Finds every record in a collection that matches the filter.
    async fn find_many(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError>;

    /// Creates a record under the given ID.
    ///
    /// # Errors
    /// Returns [`StorageError::Conflict`] if the ID is already taken.
    async fn create(&self, collection: &str, id: &str, record: Record) -> Result<(), StorageError>;

    /// Merges `patch` into an existing record and returns the updated record.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if the record does not exist.
    async fn update(&self, collection: &str, id: &str, patch: Record) -> Result<Record, StorageError>;
}

/// Ordered urgency used only for escalation dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    /// Informational, no action needed.
    Low,
    /// Someone should look soon.
    High,
    /// Page someone now.
    Urgent,
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// Represents an error raised by the notification sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// The channel is unknown to the sink.
    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),

    /// Delivery failed.
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// External notification sink.
///
/// Fire-and-forget from the core's perspective: a failed delivery is logged by
/// the caller and never turned into a task failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a priority-tagged message to a channel.
    async fn send(
        &self,
        priority: NotificationPriority,
        channel: &str,
        title: &str,
        message: &str,
    ) -> Result<(), NotificationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_priority_ordering() {
        assert!(NotificationPriority::Low < NotificationPriority::High);
        assert!(NotificationPriority::High < NotificationPriority::Urgent);
        assert_eq!(NotificationPriority::Urgent.to_string(), "urgent");
    }

    #[test]
    fn test_record_filter_matches() {
        let record = json!({"sku": "SKU-1", "warehouse": "north", "stock": 4});

        assert!(RecordFilter::new().matches(&record));
        assert!(RecordFilter::new().with_field("warehouse", "north").matches(&record));
        assert!(
            RecordFilter::new()
                .with_field("warehouse", "north")
                .with_field("stock", 4)
                .matches(&record)
        );
        assert!(!RecordFilter::new().with_field("warehouse", "south").matches(&record));
        assert!(!RecordFilter::new().with_field("missing", 1).matches(&record));
    }

    #[test]
    fn test_storage_error_transience() {
        assert!(StorageError::Unavailable("timeout".to_string()).is_transient());
        assert!(
            !StorageError::NotFound { collection: "c".to_string(), id: "1".to_string() }
                .is_transient()
        );
    }
}
