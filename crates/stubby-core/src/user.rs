use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identifier of the user owning a claim on a short link.
///
/// User ids are issued by the authentication layer; storage only requires
/// them to be non-empty.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> std::result::Result<Self, CoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::InvalidUserId("user id cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Creates a `UserId` without validation.
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
