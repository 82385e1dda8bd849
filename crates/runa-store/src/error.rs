// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The storage backend failed; the caller may retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Integrity(msg.clone().unwrap_or_else(|| code.to_string()))
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Integrity(format!("corrupt JSON column: {e}"))
    }
}
