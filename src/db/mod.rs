pub mod memory;
pub mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

/// A collaboration group joined to its parent form.
#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: Uuid,
    pub group_code: String,
    pub group_name: String,
    pub is_active: bool,
    pub form_id: Uuid,
    pub form_title: String,
    pub form_active: bool,
}

/// Declared type of a form field, driving value validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Textarea,
    Email,
    Number,
    Select,
    Radio,
    Checkbox,
}

impl FieldKind {
    /// Parse the stored type name. Unknown types validate as free text so a
    /// form-builder addition cannot strand an existing room.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "text" => FieldKind::Text,
            "textarea" => FieldKind::Textarea,
            "email" => FieldKind::Email,
            "number" => FieldKind::Number,
            "select" | "dropdown" => FieldKind::Select,
            "radio" => FieldKind::Radio,
            "checkbox" | "multiselect" => FieldKind::Checkbox,
            other => {
                warn!("Unknown field type '{}', validating as text", other);
                FieldKind::Text
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Textarea => "textarea",
            FieldKind::Email => "email",
            FieldKind::Number => "number",
            FieldKind::Select => "select",
            FieldKind::Radio => "radio",
            FieldKind::Checkbox => "checkbox",
        }
    }
}

/// Definition of one field within a form.
#[derive(Debug, Clone)]
pub struct FieldRow {
    pub form_id: Uuid,
    pub field_id: String,
    pub label: String,
    pub kind: FieldKind,
}

/// A live field lock.
#[derive(Debug, Clone)]
pub struct LockRow {
    pub field_id: String,
    pub user_id: String,
    pub user_email: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub enum LockAttempt {
    Acquired,
    Held { user_id: String, user_email: String },
}

/// An expired lock removed by the sweeper, with the room it belonged to.
#[derive(Debug, Clone)]
pub struct ExpiredLock {
    pub group_code: String,
    pub field_id: String,
}

/// Storage boundary for the collaboration engine.
///
/// Implementations must guarantee:
/// - `acquire_lock` is atomic: under concurrent attempts for the same
///   (group, field), exactly one caller observes `Acquired` while the lock
///   is live. Re-acquiring a lock already held by the same user succeeds
///   and extends its expiry.
/// - `delete_expired_locks` removes and returns each expired lock exactly
///   once, even across concurrent sweeps.
/// - At most one unsubmitted draft response exists per group; concurrent
///   first edits converge on the same draft.
#[async_trait]
pub trait CollabStore: Send + Sync {
    /// Look up a group by its sharing code, joined to its form.
    async fn group_by_code(&self, group_code: &str) -> Result<Option<GroupRow>, StoreError>;

    /// Look up one field definition of a form.
    async fn field(&self, form_id: Uuid, field_id: &str) -> Result<Option<FieldRow>, StoreError>;

    /// Try to take the (group, field) lock for a user until `expires_at`.
    async fn acquire_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        user_email: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError>;

    /// Release a lock if and only if `user_id` holds it.
    async fn release_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    /// Extend a live lock held by `user_id`. Expired locks are not revived.
    async fn refresh_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// The live lock on one field, if any.
    async fn field_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
    ) -> Result<Option<LockRow>, StoreError>;

    /// All live locks of a group, for the snapshot sent to joiners.
    async fn group_locks(&self, group_id: Uuid) -> Result<Vec<LockRow>, StoreError>;

    /// Drop every lock a user holds in a group. Returns the freed field ids.
    async fn release_user_locks(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove all expired locks across every group.
    async fn delete_expired_locks(&self) -> Result<Vec<ExpiredLock>, StoreError>;

    /// Number of currently live locks, for diagnostics.
    async fn count_live_locks(&self) -> Result<u32, StoreError>;

    /// Field values of the group's current draft (empty if no draft exists).
    async fn draft_values(&self, group_id: Uuid) -> Result<HashMap<String, String>, StoreError>;

    /// Write one field value into the group's current draft, creating the
    /// draft if absent. Returns the draft's response id.
    async fn upsert_draft_value(
        &self,
        group_id: Uuid,
        field_id: &str,
        value: &str,
        user_id: &str,
    ) -> Result<Uuid, StoreError>;

    /// Upsert the attribution entry for (group, field, user).
    async fn record_contribution(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Stamp the group's current draft as submitted with the given values,
    /// creating the draft first if nobody edited. Returns the response id.
    async fn finalize_draft(
        &self,
        group_id: Uuid,
        user_id: &str,
        values: &HashMap<String, String>,
    ) -> Result<Uuid, StoreError>;

    /// Discard the group's current draft. Returns whether one existed.
    async fn discard_draft(&self, group_id: Uuid) -> Result<bool, StoreError>;

    /// Cheap connectivity check for the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
