use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinFormMessage {
    pub group_code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveFormMessage {
    pub group_code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockFieldMessage {
    pub group_code: String,
    pub field_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnlockFieldMessage {
    pub group_code: String,
    pub field_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdateMessage {
    pub group_code: String,
    pub field_id: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub group_code: String,
    pub field_id: String,
}

/// Clients may attach their own responseId and submittedBy; the server
/// replaces both with authoritative values in the broadcast.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmitMessage {
    pub group_code: String,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub form_data: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormResetMessage {
    pub group_code: String,
    #[serde(default)]
    pub reset_by: Option<String>,
}

/// Messages a client can send over the collaboration socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join-form")]
    JoinForm(JoinFormMessage),
    #[serde(rename = "leave-form")]
    LeaveForm(LeaveFormMessage),
    #[serde(rename = "lock-field")]
    LockField(LockFieldMessage),
    #[serde(rename = "unlock-field")]
    UnlockField(UnlockFieldMessage),
    #[serde(rename = "field-update")]
    FieldUpdate(FieldUpdateMessage),
    #[serde(rename = "typing-start")]
    TypingStart(TypingMessage),
    #[serde(rename = "typing-stop")]
    TypingStop(TypingMessage),
    #[serde(rename = "form-submit")]
    FormSubmit(FormSubmitMessage),
    #[serde(rename = "form-reset")]
    FormReset(FormResetMessage),
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedMessage {
    pub user_email: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftMessage {
    pub user_email: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUsersMessage {
    pub users: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfoMessage {
    pub group_code: String,
    pub group_name: String,
    pub form_id: Uuid,
    pub form_title: String,
}

/// One entry of the lock table snapshot sent to a joining client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub user_id: String,
    pub user_email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentLocksMessage {
    pub locks: HashMap<String, LockEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormDataSyncMessage {
    pub form_data: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldLockedMessage {
    pub field_id: String,
    pub user_id: String,
    pub user_email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldUnlockedMessage {
    pub field_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockFailedMessage {
    pub field_id: String,
    pub reason: String,
    pub locked_by: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdatedMessage {
    pub field_id: String,
    pub value: String,
    pub updated_by: String,
    pub field_label: String,
    pub group_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingMessage {
    pub field_id: String,
    pub user_email: String,
    pub typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmittedAllMessage {
    pub submitted_by: String,
    pub response_id: Uuid,
    pub form_title: String,
    pub group_name: String,
    pub timestamp: DateTime<Utc>,
    pub form_data: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormResetAllMessage {
    pub reset_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

/// Messages the server emits to connected clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "user-joined")]
    UserJoined(UserJoinedMessage),
    #[serde(rename = "user-left")]
    UserLeft(UserLeftMessage),
    #[serde(rename = "active-users")]
    ActiveUsers(ActiveUsersMessage),
    #[serde(rename = "group-info")]
    GroupInfo(GroupInfoMessage),
    #[serde(rename = "current-locks")]
    CurrentLocks(CurrentLocksMessage),
    #[serde(rename = "form-data-sync")]
    FormDataSync(FormDataSyncMessage),
    #[serde(rename = "field-locked")]
    FieldLocked(FieldLockedMessage),
    #[serde(rename = "field-unlocked")]
    FieldUnlocked(FieldUnlockedMessage),
    #[serde(rename = "lock-failed")]
    LockFailed(LockFailedMessage),
    #[serde(rename = "field-updated")]
    FieldUpdated(FieldUpdatedMessage),
    #[serde(rename = "user-typing")]
    UserTyping(UserTypingMessage),
    #[serde(rename = "form-submitted-all")]
    FormSubmittedAll(FormSubmittedAllMessage),
    #[serde(rename = "form-reset-all")]
    FormResetAll(FormResetAllMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
    #[serde(rename = "error")]
    Error(ErrorMessage),
}
