pub mod registry;
pub mod sweeper;
pub mod validate;

use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::registry::{RoomRegistry, SessionHandle};
use crate::db::{CollabStore, FieldRow, GroupRow, LockAttempt, StoreError};
use crate::models::{
    ActiveUsersMessage, ClientEvent, CollabError, CurrentLocksMessage, ErrorMessage,
    FieldLockedMessage, FieldUnlockedMessage, FieldUpdatedMessage, FormDataSyncMessage,
    FormResetAllMessage, FormSubmittedAllMessage, GroupInfoMessage, LockEntry, LockFailedMessage,
    PongMessage, ServerEvent, UserJoinedMessage, UserLeftMessage, UserTypingMessage,
};

/// The collaboration session engine.
///
/// Owns live room membership and drives every room-scoped operation:
/// join/leave, field locking, update propagation, typing relay, the
/// submit/reset barriers and expired-lock sweeping. All durable state goes
/// through the injected store; membership is never persisted.
pub struct CollabEngine {
    store: Arc<dyn CollabStore>,
    rooms: RoomRegistry,
    lease: Duration,
    field_cache: Cache<(Uuid, String), FieldRow>,
    write_order: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CollabEngine {
    pub fn new(store: Arc<dyn CollabStore>, lease_secs: u64) -> Self {
        Self {
            store,
            rooms: RoomRegistry::new(),
            lease: Duration::seconds(lease_secs as i64),
            field_cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(StdDuration::from_secs(5 * 60))
                .build(),
            write_order: Mutex::new(HashMap::new()),
        }
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + self.lease
    }

    /// Dispatch one parsed client event, mapping engine errors to the
    /// events the acting session expects.
    pub async fn handle_event(&self, session: &SessionHandle, event: ClientEvent) {
        let result = match event {
            ClientEvent::JoinForm(msg) => self.join_group(session, &msg.group_code).await,
            ClientEvent::LeaveForm(msg) => {
                self.leave_group(session, &msg.group_code).await;
                Ok(())
            }
            ClientEvent::LockField(msg) => {
                self.lock_field(session, &msg.group_code, &msg.field_id).await
            }
            ClientEvent::UnlockField(msg) => {
                self.unlock_field(session, &msg.group_code, &msg.field_id)
                    .await
            }
            ClientEvent::FieldUpdate(msg) => {
                self.update_field(session, &msg.group_code, &msg.field_id, &msg.value)
                    .await
            }
            ClientEvent::TypingStart(msg) => {
                self.relay_typing(session, &msg.group_code, &msg.field_id, true)
                    .await;
                Ok(())
            }
            ClientEvent::TypingStop(msg) => {
                self.relay_typing(session, &msg.group_code, &msg.field_id, false)
                    .await;
                Ok(())
            }
            ClientEvent::FormSubmit(msg) => {
                self.submit_form(session, &msg.group_code, msg.form_data)
                    .await
            }
            ClientEvent::FormReset(msg) => self.reset_form(session, &msg.group_code).await,
            ClientEvent::Ping => {
                session.send(ServerEvent::Pong(PongMessage {
                    date: Utc::now().to_rfc3339(),
                }));
                Ok(())
            }
        };

        if let Err(err) = result {
            self.deliver_error(session, err);
        }
    }

    /// Map an engine error to the event the acting session receives. Lock
    /// conflicts become lock-failed with the holder named; storage failures
    /// are logged and reported without detail.
    fn deliver_error(&self, session: &SessionHandle, err: CollabError) {
        match err {
            CollabError::LockConflict {
                field_id,
                holder_email,
                ..
            } => {
                session.send(ServerEvent::LockFailed(LockFailedMessage {
                    field_id,
                    reason: format!("Field is currently locked by {}", holder_email),
                    locked_by: Some(holder_email),
                }));
            }
            CollabError::Storage(e) => {
                error!("Storage failure for {}: {}", session.user.email, e);
                session.send(ServerEvent::Error(ErrorMessage {
                    message: "Internal server error".to_string(),
                }));
            }
            other => {
                session.send(ServerEvent::Error(ErrorMessage {
                    message: other.to_string(),
                }));
            }
        }
    }

    /// Look up a group and require it and its parent form to be active.
    async fn active_group(&self, group_code: &str) -> Result<GroupRow, CollabError> {
        let group = self
            .store
            .group_by_code(group_code)
            .await?
            .ok_or_else(|| CollabError::GroupNotFound(group_code.to_string()))?;
        if !group.is_active {
            return Err(CollabError::GroupInactive(group_code.to_string()));
        }
        if !group.form_active {
            return Err(CollabError::FormInactive(group_code.to_string()));
        }
        Ok(group)
    }

    /// Look up a group without the activity check. Lock verbs only need the
    /// room to exist; releasing in a just-deactivated group stays possible.
    async fn known_group(&self, group_code: &str) -> Result<GroupRow, CollabError> {
        self.store
            .group_by_code(group_code)
            .await?
            .ok_or_else(|| CollabError::GroupNotFound(group_code.to_string()))
    }

    /// Field definitions are effectively immutable and served from a cache.
    /// Group and form activity is deliberately always read live.
    async fn field_def(
        &self,
        form_id: Uuid,
        field_id: &str,
    ) -> Result<Option<FieldRow>, StoreError> {
        let key = (form_id, field_id.to_string());
        if let Some(hit) = self.field_cache.get(&key).await {
            return Ok(Some(hit));
        }
        let fetched = self.store.field(form_id, field_id).await?;
        if let Some(row) = &fetched {
            self.field_cache.insert(key, row.clone()).await;
        }
        Ok(fetched)
    }

    /// The group's write-order lock. Draft mutations and their broadcasts
    /// run under it, so a room receives writes in the order they persisted.
    async fn group_write_lock(&self, group_id: Uuid) -> Arc<Mutex<()>> {
        let mut order = self.write_order.lock().await;
        order
            .entry(group_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn broadcast_roster(&self, group_code: &str) {
        let users = self.rooms.active_emails(group_code).await;
        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::ActiveUsers(ActiveUsersMessage { users }),
                None,
            )
            .await;
    }

    /// Join a session to a group's room.
    ///
    /// The joiner receives the group metadata, the live lock table and the
    /// current draft, in that order, so a late joiner starts in sync. The
    /// whole room then hears about the new member and gets a fresh roster.
    pub async fn join_group(
        &self,
        session: &SessionHandle,
        group_code: &str,
    ) -> Result<(), CollabError> {
        let group = self.active_group(group_code).await?;

        self.rooms.join(group_code, session).await;

        let snapshot = async {
            let locks = self.store.group_locks(group.id).await?;
            let form_data = self.store.draft_values(group.id).await?;
            Ok::<_, StoreError>((locks, form_data))
        }
        .await;
        let (locks, form_data) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Roll the membership back so a half-joined session does not
                // linger in the roster.
                self.rooms.leave(group_code, session.conn_id).await;
                return Err(e.into());
            }
        };

        session.send(ServerEvent::GroupInfo(GroupInfoMessage {
            group_code: group.group_code.clone(),
            group_name: group.group_name.clone(),
            form_id: group.form_id,
            form_title: group.form_title.clone(),
        }));
        let locks = locks
            .into_iter()
            .map(|lock| {
                (
                    lock.field_id,
                    LockEntry {
                        user_id: lock.user_id,
                        user_email: lock.user_email,
                        expires_at: lock.expires_at,
                    },
                )
            })
            .collect();
        session.send(ServerEvent::CurrentLocks(CurrentLocksMessage { locks }));
        session.send(ServerEvent::FormDataSync(FormDataSyncMessage { form_data }));

        info!("{} joined group {}", session.user.email, group_code);

        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::UserJoined(UserJoinedMessage {
                    user_email: session.user.email.clone(),
                    timestamp: Utc::now(),
                }),
                None,
            )
            .await;
        self.broadcast_roster(group_code).await;

        Ok(())
    }

    /// Remove a session from a room. Locks stay with the holder until they
    /// expire, are released explicitly, or the connection drops.
    pub async fn leave_group(&self, session: &SessionHandle, group_code: &str) {
        if !self.rooms.leave(group_code, session.conn_id).await {
            return;
        }

        info!("{} left group {}", session.user.email, group_code);

        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::UserLeft(UserLeftMessage {
                    user_email: session.user.email.clone(),
                    timestamp: Utc::now(),
                }),
                None,
            )
            .await;
        self.broadcast_roster(group_code).await;
    }

    /// Tear down a closed connection: membership is dropped from every room
    /// it joined and its field locks are released. Cleanup is best effort; a
    /// failed release is left for the expiry sweeper.
    pub async fn disconnect(&self, session: &SessionHandle) {
        let left_rooms = self.rooms.drop_connection(session.conn_id).await;

        for group_code in left_rooms {
            match self.release_locks_for(&group_code, session).await {
                Ok(freed) => {
                    for field_id in freed {
                        self.rooms
                            .broadcast(
                                &group_code,
                                &ServerEvent::FieldUnlocked(FieldUnlockedMessage { field_id }),
                                None,
                            )
                            .await;
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to release locks for {} in group {}: {}",
                        session.user.email, group_code, e
                    );
                }
            }

            self.rooms
                .broadcast(
                    &group_code,
                    &ServerEvent::UserLeft(UserLeftMessage {
                        user_email: session.user.email.clone(),
                        timestamp: Utc::now(),
                    }),
                    None,
                )
                .await;
            self.broadcast_roster(&group_code).await;
        }

        info!(
            "Session {} for {} disconnected",
            session.conn_id, session.user.email
        );
    }

    async fn release_locks_for(
        &self,
        group_code: &str,
        session: &SessionHandle,
    ) -> Result<Vec<String>, CollabError> {
        let group = self.known_group(group_code).await?;
        Ok(self
            .store
            .release_user_locks(group.id, &session.user.user_id)
            .await?)
    }

    /// Take the exclusive lease on a field for the lease duration.
    ///
    /// Re-acquiring a lock this user already holds just extends it. A
    /// conflict comes back as an error naming the current holder.
    pub async fn lock_field(
        &self,
        session: &SessionHandle,
        group_code: &str,
        field_id: &str,
    ) -> Result<(), CollabError> {
        let group = self.known_group(group_code).await?;

        let attempt = self
            .store
            .acquire_lock(
                group.id,
                field_id,
                &session.user.user_id,
                &session.user.email,
                self.lease_deadline(),
            )
            .await?;

        match attempt {
            LockAttempt::Acquired => {
                debug!(
                    "{} locked field {} in group {}",
                    session.user.email, field_id, group_code
                );
                self.rooms
                    .broadcast(
                        group_code,
                        &ServerEvent::FieldLocked(FieldLockedMessage {
                            field_id: field_id.to_string(),
                            user_id: session.user.user_id.clone(),
                            user_email: session.user.email.clone(),
                        }),
                        Some(session.conn_id),
                    )
                    .await;
                Ok(())
            }
            LockAttempt::Held {
                user_id,
                user_email,
            } => Err(CollabError::LockConflict {
                field_id: field_id.to_string(),
                holder_id: user_id,
                holder_email: user_email,
            }),
        }
    }

    /// Release a lock. Only the holder can release; anyone else's request
    /// is a silent no-op so a stale client cannot free someone's field.
    pub async fn unlock_field(
        &self,
        session: &SessionHandle,
        group_code: &str,
        field_id: &str,
    ) -> Result<(), CollabError> {
        let group = self.known_group(group_code).await?;

        let released = self
            .store
            .release_lock(group.id, field_id, &session.user.user_id)
            .await?;

        if released {
            debug!(
                "{} unlocked field {} in group {}",
                session.user.email, field_id, group_code
            );
            self.rooms
                .broadcast(
                    group_code,
                    &ServerEvent::FieldUnlocked(FieldUnlockedMessage {
                        field_id: field_id.to_string(),
                    }),
                    Some(session.conn_id),
                )
                .await;
        }
        Ok(())
    }

    /// Validate, persist and relay one field edit.
    ///
    /// The draft write and its broadcast run under the group's write order:
    /// the room is never told about a change that did not persist, and
    /// accepted updates are delivered in the order their writes landed.
    pub async fn update_field(
        &self,
        session: &SessionHandle,
        group_code: &str,
        field_id: &str,
        raw_value: &str,
    ) -> Result<(), CollabError> {
        let group = self.active_group(group_code).await?;

        let field = self
            .field_def(group.form_id, field_id)
            .await?
            .ok_or_else(|| CollabError::FieldNotFound(field_id.to_string()))?;

        // An empty normalized value clears the field and skips validation.
        let value = validate::normalize(raw_value);
        if !value.is_empty() {
            validate::validate_value(field.kind, &value).map_err(|reason| {
                CollabError::InvalidValue {
                    field_id: field_id.to_string(),
                    reason,
                }
            })?;
        }

        // Lock authorization is re-checked on every update: writing is
        // allowed when the field is unlocked or locked by this same user.
        let holds_lock = match self.store.field_lock(group.id, field_id).await? {
            Some(lock) if lock.user_id != session.user.user_id => {
                return Err(CollabError::LockConflict {
                    field_id: field_id.to_string(),
                    holder_id: lock.user_id,
                    holder_email: lock.user_email,
                });
            }
            Some(_) => true,
            None => false,
        };

        let write_lock = self.group_write_lock(group.id).await;
        let order = write_lock.lock().await;
        self.store
            .upsert_draft_value(group.id, field_id, &value, &session.user.user_id)
            .await?;
        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::FieldUpdated(FieldUpdatedMessage {
                    field_id: field_id.to_string(),
                    value: value.clone(),
                    updated_by: session.user.email.clone(),
                    field_label: field.label.clone(),
                    group_name: group.group_name.clone(),
                    timestamp: Utc::now(),
                }),
                Some(session.conn_id),
            )
            .await;
        drop(order);

        // The value is persisted and announced at this point. Attribution
        // and lease upkeep are best effort and never retract it.
        if !value.is_empty() {
            if let Err(e) = self
                .store
                .record_contribution(group.id, field_id, &session.user.user_id, &value)
                .await
            {
                warn!(
                    "Failed to record {}'s contribution on field {}: {}",
                    session.user.email, field_id, e
                );
            }
        }

        // An edit by the holder keeps the lease alive.
        if holds_lock {
            if let Err(e) = self
                .store
                .refresh_lock(
                    group.id,
                    field_id,
                    &session.user.user_id,
                    self.lease_deadline(),
                )
                .await
            {
                warn!(
                    "Failed to refresh {}'s lease on field {}: {}",
                    session.user.email, field_id, e
                );
            }
        }

        Ok(())
    }

    /// Relay a typing signal to the rest of the room. Stateless and
    /// fire-and-forget: nothing is stored and nothing can fail.
    pub async fn relay_typing(
        &self,
        session: &SessionHandle,
        group_code: &str,
        field_id: &str,
        typing: bool,
    ) {
        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::UserTyping(UserTypingMessage {
                    field_id: field_id.to_string(),
                    user_email: session.user.email.clone(),
                    typing,
                }),
                Some(session.conn_id),
            )
            .await;
    }

    /// Finalize the group's shared response and fan the result out to every
    /// member, the submitter included. Any member can submit for the room.
    pub async fn submit_form(
        &self,
        session: &SessionHandle,
        group_code: &str,
        form_data: HashMap<String, String>,
    ) -> Result<(), CollabError> {
        let group = self.active_group(group_code).await?;

        // A barrier takes the same per-group write order as field edits, so
        // no update broadcast can land between the finalize and its
        // announcement.
        let write_lock = self.group_write_lock(group.id).await;
        let _order = write_lock.lock().await;

        let response_id = self
            .store
            .finalize_draft(group.id, &session.user.user_id, &form_data)
            .await?;

        info!(
            "{} submitted group {} as response {}",
            session.user.email, group_code, response_id
        );

        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::FormSubmittedAll(FormSubmittedAllMessage {
                    submitted_by: session.user.email.clone(),
                    response_id,
                    form_title: group.form_title.clone(),
                    group_name: group.group_name.clone(),
                    timestamp: Utc::now(),
                    form_data,
                }),
                None,
            )
            .await;

        Ok(())
    }

    /// Discard the group's current draft so the room starts a fresh shared
    /// response. Experienced by every member at once, like submit.
    pub async fn reset_form(
        &self,
        session: &SessionHandle,
        group_code: &str,
    ) -> Result<(), CollabError> {
        let group = self.active_group(group_code).await?;

        let write_lock = self.group_write_lock(group.id).await;
        let _order = write_lock.lock().await;

        self.store.discard_draft(group.id).await?;

        info!("{} reset group {}", session.user.email, group_code);

        self.rooms
            .broadcast(
                group_code,
                &ServerEvent::FormResetAll(FormResetAllMessage {
                    reset_by: session.user.email.clone(),
                    timestamp: Utc::now(),
                }),
                None,
            )
            .await;

        Ok(())
    }

    /// Remove expired locks and notify each affected room. Returns how many
    /// locks were reclaimed.
    pub async fn sweep_expired_locks(&self) -> Result<usize, StoreError> {
        let expired = self.store.delete_expired_locks().await?;
        let count = expired.len();
        for lock in expired {
            debug!(
                "Lock on field {} in group {} expired",
                lock.field_id, lock.group_code
            );
            let event = ServerEvent::FieldUnlocked(FieldUnlockedMessage {
                field_id: lock.field_id,
            });
            self.rooms.broadcast(&lock.group_code, &event, None).await;
        }
        Ok(count)
    }

    /// Number of connections currently in at least one room.
    pub async fn connection_count(&self) -> usize {
        self.rooms.connection_count().await
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    /// Live lock count straight from the store, for diagnostics.
    pub async fn live_lock_count(&self) -> Result<u32, StoreError> {
        self.store.count_live_locks().await
    }

    /// Whether the backing store answers, for the readiness check.
    pub async fn store_ready(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}
