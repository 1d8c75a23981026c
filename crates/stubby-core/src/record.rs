use crate::shortcode::ShortCode;
use crate::user::UserId;
use serde::{Deserialize, Serialize};

/// A stored short link, shared by every user who shortened the same URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortLinkRecord {
    /// Storage-assigned identifier.
    pub id: i64,
    /// The original URL that was shortened.
    pub original_url: String,
    /// Code derived from `original_url`.
    pub short_code: ShortCode,
}

/// One user's claim on a [`ShortLinkRecord`].
///
/// `(user_id, short_link_id)` is unique and `is_deleted` only ever moves from
/// `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLinkRecord {
    pub user_id: UserId,
    pub short_link_id: i64,
    #[serde(default)]
    pub is_deleted: bool,
}
