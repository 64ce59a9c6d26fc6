use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{
    CollabStore, ExpiredLock, FieldKind, FieldRow, GroupRow, LockAttempt, LockRow, StoreError,
};
use async_trait::async_trait;

/// In-memory collaboration store, used by the tests and by storage-less
/// local runs.
///
/// Every verb runs under a single async mutex, which gives it the same
/// atomicity the Postgres store gets from its uniqueness constraints.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

#[derive(Default)]
struct MemStoreInner {
    forms: HashMap<Uuid, FormRec>,
    fields: HashMap<(Uuid, String), FieldRow>,
    groups: HashMap<Uuid, GroupRec>,
    locks: HashMap<(Uuid, String), LockRec>,
    drafts: HashMap<Uuid, DraftRec>,
    submitted: Vec<SubmittedRec>,
    contributions: HashMap<(Uuid, String, String), String>,
}

struct FormRec {
    title: String,
    active: bool,
}

struct GroupRec {
    code: String,
    name: String,
    active: bool,
    form_id: Uuid,
}

struct LockRec {
    user_id: String,
    user_email: String,
    expires_at: DateTime<Utc>,
}

struct DraftRec {
    response_id: Uuid,
    values: HashMap<String, String>,
}

struct SubmittedRec {
    response_id: Uuid,
    group_id: Uuid,
    submitted_by: String,
    values: HashMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a form definition. Returns its id.
    pub async fn add_form(&self, title: &str, active: bool) -> Uuid {
        let form_id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        inner.forms.insert(
            form_id,
            FormRec {
                title: title.to_string(),
                active,
            },
        );
        form_id
    }

    /// Seed one field of a form.
    pub async fn add_field(&self, form_id: Uuid, field_id: &str, label: &str, kind: FieldKind) {
        let mut inner = self.inner.lock().await;
        inner.fields.insert(
            (form_id, field_id.to_string()),
            FieldRow {
                form_id,
                field_id: field_id.to_string(),
                label: label.to_string(),
                kind,
            },
        );
    }

    /// Seed a group with a sharing code. Returns its id.
    pub async fn add_group(
        &self,
        form_id: Uuid,
        group_code: &str,
        group_name: &str,
        active: bool,
    ) -> Uuid {
        let group_id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        inner.groups.insert(
            group_id,
            GroupRec {
                code: group_code.to_string(),
                name: group_name.to_string(),
                active,
                form_id,
            },
        );
        group_id
    }

    pub async fn set_group_active(&self, group_id: Uuid, active: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(group) = inner.groups.get_mut(&group_id) {
            group.active = active;
        }
    }

    pub async fn set_form_active(&self, form_id: Uuid, active: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(form) = inner.forms.get_mut(&form_id) {
            form.active = active;
        }
    }

    /// Submitted responses recorded for a group, for test inspection.
    pub async fn submitted_responses(&self, group_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.lock().await;
        inner
            .submitted
            .iter()
            .filter(|rec| rec.group_id == group_id)
            .map(|rec| rec.response_id)
            .collect()
    }

    /// Submitter id and final values of a submitted response, for test
    /// inspection.
    pub async fn submitted_record(
        &self,
        response_id: Uuid,
    ) -> Option<(String, HashMap<String, String>)> {
        let inner = self.inner.lock().await;
        inner
            .submitted
            .iter()
            .find(|rec| rec.response_id == response_id)
            .map(|rec| (rec.submitted_by.clone(), rec.values.clone()))
    }

    /// Attribution value recorded for (group, field, user), if any.
    pub async fn contribution(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
    ) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .contributions
            .get(&(group_id, field_id.to_string(), user_id.to_string()))
            .cloned()
    }
}

fn live(lock: &LockRec, now: DateTime<Utc>) -> bool {
    lock.expires_at > now
}

#[async_trait]
impl CollabStore for MemStore {
    async fn group_by_code(&self, group_code: &str) -> Result<Option<GroupRow>, StoreError> {
        let inner = self.inner.lock().await;
        let found = inner
            .groups
            .iter()
            .find(|(_, group)| group.code == group_code);
        match found {
            Some((id, group)) => {
                let form = inner.forms.get(&group.form_id).ok_or_else(|| {
                    StoreError::Internal(format!("group {} references missing form", group.code))
                })?;
                Ok(Some(GroupRow {
                    id: *id,
                    group_code: group.code.clone(),
                    group_name: group.name.clone(),
                    is_active: group.active,
                    form_id: group.form_id,
                    form_title: form.title.clone(),
                    form_active: form.active,
                }))
            }
            None => Ok(None),
        }
    }

    async fn field(&self, form_id: Uuid, field_id: &str) -> Result<Option<FieldRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.fields.get(&(form_id, field_id.to_string())).cloned())
    }

    async fn acquire_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        user_email: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let key = (group_id, field_id.to_string());

        if let Some(existing) = inner.locks.get(&key) {
            if live(existing, now) && existing.user_id != user_id {
                return Ok(LockAttempt::Held {
                    user_id: existing.user_id.clone(),
                    user_email: existing.user_email.clone(),
                });
            }
        }

        inner.locks.insert(
            key,
            LockRec {
                user_id: user_id.to_string(),
                user_email: user_email.to_string(),
                expires_at,
            },
        );
        Ok(LockAttempt::Acquired)
    }

    async fn release_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (group_id, field_id.to_string());
        match inner.locks.get(&key) {
            Some(lock) if lock.user_id == user_id => {
                inner.locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.locks.get_mut(&(group_id, field_id.to_string())) {
            Some(lock) if lock.user_id == user_id && live(lock, now) => {
                lock.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn field_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
    ) -> Result<Option<LockRow>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .locks
            .get(&(group_id, field_id.to_string()))
            .filter(|lock| live(lock, now))
            .map(|lock| LockRow {
                field_id: field_id.to_string(),
                user_id: lock.user_id.clone(),
                user_email: lock.user_email.clone(),
                expires_at: lock.expires_at,
            }))
    }

    async fn group_locks(&self, group_id: Uuid) -> Result<Vec<LockRow>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut locks: Vec<LockRow> = inner
            .locks
            .iter()
            .filter(|((gid, _), lock)| *gid == group_id && live(lock, now))
            .map(|((_, field_id), lock)| LockRow {
                field_id: field_id.clone(),
                user_id: lock.user_id.clone(),
                user_email: lock.user_email.clone(),
                expires_at: lock.expires_at,
            })
            .collect();
        locks.sort_by(|a, b| a.field_id.cmp(&b.field_id));
        Ok(locks)
    }

    async fn release_user_locks(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<(Uuid, String)> = inner
            .locks
            .iter()
            .filter(|((gid, _), lock)| *gid == group_id && lock.user_id == user_id)
            .map(|(key, _)| key.clone())
            .collect();
        let mut freed = Vec::with_capacity(keys.len());
        for key in keys {
            inner.locks.remove(&key);
            freed.push(key.1);
        }
        freed.sort();
        Ok(freed)
    }

    async fn delete_expired_locks(&self) -> Result<Vec<ExpiredLock>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let keys: Vec<(Uuid, String)> = inner
            .locks
            .iter()
            .filter(|(_, lock)| !live(lock, now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut expired = Vec::with_capacity(keys.len());
        for key in keys {
            inner.locks.remove(&key);
            let group_code = match inner.groups.get(&key.0) {
                Some(group) => group.code.clone(),
                None => continue,
            };
            expired.push(ExpiredLock {
                group_code,
                field_id: key.1,
            });
        }
        Ok(expired)
    }

    async fn count_live_locks(&self) -> Result<u32, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner.locks.values().filter(|lock| live(lock, now)).count() as u32)
    }

    async fn draft_values(&self, group_id: Uuid) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .drafts
            .get(&group_id)
            .map(|draft| draft.values.clone())
            .unwrap_or_default())
    }

    async fn upsert_draft_value(
        &self,
        group_id: Uuid,
        field_id: &str,
        value: &str,
        _user_id: &str,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        let draft = inner.drafts.entry(group_id).or_insert_with(|| DraftRec {
            response_id: Uuid::new_v4(),
            values: HashMap::new(),
        });
        draft.values.insert(field_id.to_string(), value.to_string());
        Ok(draft.response_id)
    }

    async fn record_contribution(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.contributions.insert(
            (group_id, field_id.to_string(), user_id.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    async fn finalize_draft(
        &self,
        group_id: Uuid,
        user_id: &str,
        values: &HashMap<String, String>,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut draft = inner.drafts.remove(&group_id).unwrap_or_else(|| DraftRec {
            response_id: Uuid::new_v4(),
            values: HashMap::new(),
        });
        for (field_id, value) in values {
            draft.values.insert(field_id.clone(), value.clone());
        }
        let response_id = draft.response_id;
        inner.submitted.push(SubmittedRec {
            response_id,
            group_id,
            submitted_by: user_id.to_string(),
            values: draft.values,
        });
        Ok(response_id)
    }

    async fn discard_draft(&self, group_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.drafts.remove(&group_id).is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded() -> (MemStore, Uuid, Uuid) {
        let store = MemStore::new();
        let form_id = store.add_form("Trip planning", true).await;
        store
            .add_field(form_id, "name", "Full name", FieldKind::Text)
            .await;
        let group_id = store.add_group(form_id, "ABC123", "Team Rocket", true).await;
        (store, form_id, group_id)
    }

    #[tokio::test]
    async fn group_lookup_joins_form_metadata() {
        let (store, form_id, group_id) = seeded().await;
        let group = store.group_by_code("ABC123").await.unwrap().unwrap();
        assert_eq!(group.id, group_id);
        assert_eq!(group.form_id, form_id);
        assert_eq!(group.form_title, "Trip planning");
        assert!(group.is_active);
        assert!(store.group_by_code("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn draft_is_created_once_and_keeps_latest_value() {
        let (store, _, group_id) = seeded().await;
        let first = store
            .upsert_draft_value(group_id, "name", "Ada", "u1")
            .await
            .unwrap();
        let second = store
            .upsert_draft_value(group_id, "name", "Ada L.", "u2")
            .await
            .unwrap();
        assert_eq!(first, second);
        let values = store.draft_values(group_id).await.unwrap();
        assert_eq!(values.get("name").map(String::as_str), Some("Ada L."));
    }

    #[tokio::test]
    async fn finalize_consumes_the_draft() {
        let (store, _, group_id) = seeded().await;
        let draft_id = store
            .upsert_draft_value(group_id, "name", "Ada", "u1")
            .await
            .unwrap();
        let mut values = HashMap::new();
        values.insert("name".to_string(), "Ada Lovelace".to_string());
        let response_id = store.finalize_draft(group_id, "u1", &values).await.unwrap();
        assert_eq!(response_id, draft_id);
        assert!(store.draft_values(group_id).await.unwrap().is_empty());
        assert_eq!(store.submitted_responses(group_id).await, vec![response_id]);

        // The finalized record carries the submitter and the merged values,
        // with the submit payload overriding the draft.
        let (submitted_by, final_values) = store
            .submitted_record(response_id)
            .await
            .expect("finalized record");
        assert_eq!(submitted_by, "u1");
        assert_eq!(
            final_values.get("name").map(String::as_str),
            Some("Ada Lovelace")
        );
    }

    #[tokio::test]
    async fn expired_lock_is_not_reported_live() {
        let (store, _, group_id) = seeded().await;
        let past = Utc::now() - Duration::seconds(5);
        store
            .acquire_lock(group_id, "name", "u1", "u1@example.com", past)
            .await
            .unwrap();
        assert!(store.field_lock(group_id, "name").await.unwrap().is_none());
        assert_eq!(store.count_live_locks().await.unwrap(), 0);
        assert_eq!(store.group_locks(group_id).await.unwrap().len(), 0);
    }
}
