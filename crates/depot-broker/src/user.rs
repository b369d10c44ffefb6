//! User records.
//!
//! Authentication itself lives in the HTTP layer; the broker only records
//! the opaque token that maps 1:1 to a user. Tokens and tabs are created by
//! explicit service calls on the orchestration surface when a user is
//! created; there is no hidden signal machinery.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// A user who can own orders and a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Auto-increment row id.
    pub id: UserId,
    /// Externally-visible identifier.
    pub sid: String,
    /// Unique login name.
    pub username: String,
    /// Opaque auth token, created with the user.
    pub token: String,
}
