use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::StoreError;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Errors raised by the collaboration engine.
///
/// Lock conflicts carry the holder's identity so the client-facing notice
/// can name who is editing the field.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group {0} is no longer active")]
    GroupInactive(String),

    #[error("The form for group {0} is no longer active")]
    FormInactive(String),

    #[error("Unknown field: {0}")]
    FieldNotFound(String),

    #[error("Invalid value for field {field_id}: {reason}")]
    InvalidValue { field_id: String, reason: String },

    #[error("Field {field_id} is locked by {holder_email}")]
    LockConflict {
        field_id: String,
        holder_id: String,
        holder_email: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}
