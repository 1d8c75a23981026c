use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;

/// A short identifier standing in for an original URL.
///
/// Codes derived with [`ShortCode::from_url`] are deterministic, so two users
/// shortening the same URL end up sharing one short link.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortCode(String);

const MIN_LENGTH: usize = 3;
const MAX_LENGTH: usize = 32;

/// Length of codes derived from URL digests.
pub const DERIVED_LENGTH: usize = 8;

impl ShortCode {
    /// Derives the short code for `original_url`.
    ///
    /// The code is the first [`DERIVED_LENGTH`] base58 characters of the
    /// SHA-256 digest of the URL.
    pub fn from_url(original_url: &str) -> Self {
        let digest = Sha256::digest(original_url.as_bytes());
        let mut encoded = bs58::encode(digest).into_string();
        encoded.truncate(DERIVED_LENGTH);
        Self(encoded)
    }

    /// Parses a code received from a caller.
    pub fn new(code: impl Into<String>) -> std::result::Result<Self, CoreError> {
        let code = code.into();
        Self::validate(&code)?;
        Ok(Self(code))
    }

    /// Wraps a code read back from storage.
    pub fn new_unchecked(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Joins the code onto `base_url` with exactly one `/`.
    pub fn to_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the code and returns the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    fn validate(code: &str) -> std::result::Result<(), CoreError> {
        let len = code.len();
        if !(MIN_LENGTH..=MAX_LENGTH).contains(&len) {
            return Err(CoreError::InvalidShortCode(format!(
                "{code:?} has {len} characters, expected {MIN_LENGTH} to {MAX_LENGTH}"
            )));
        }

        if let Some(bad) = code.chars().find(|c| !is_code_char(*c)) {
            return Err(CoreError::InvalidShortCode(format!(
                "{code:?} contains {bad:?}, allowed are [A-Za-z0-9_-]"
            )));
        }

        Ok(())
    }
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

impl Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShortCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
