use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const GROUP_SIZE: usize = 4;
const MAX_GROUPS: usize = 9;
const MAX_RANDOM_TRIES: usize = 1000;
const MAX_NAME_LEN: usize = 64;

/// Unique identifier for a server instance.
///
/// Ids are short lowercase base36 groups joined by `-` (`k3x9`,
/// `k3x9-0qpz`), with a UUID form kept as a last-resort fallback. They are
/// assigned once at creation and never change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    /// Parse an id supplied from outside, normalizing case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the text is neither a grouped
    /// base36 id nor a UUID.
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = text.trim().to_ascii_lowercase();
        if is_grouped_id(&normalized) || is_uuid(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(Error::InvalidArgument(format!(
                "'{}' is not a valid server id",
                text
            )))
        }
    }

    /// Allocate the shortest id not present in `existing`.
    pub(crate) fn allocate(existing: &HashSet<ServerId>) -> Self {
        for groups in 1..=MAX_GROUPS {
            let taken = existing
                .iter()
                .filter(|id| group_count(&id.0) == Some(groups))
                .count() as u128;
            let space = 36u128
                .checked_pow((GROUP_SIZE * groups) as u32)
                .unwrap_or(u128::MAX);
            if taken >= space {
                continue;
            }

            for _ in 0..MAX_RANDOM_TRIES {
                let candidate = Self(random_id(groups));
                if !existing.contains(&candidate) {
                    return candidate;
                }
            }
        }

        loop {
            let candidate = Self(Uuid::new_v4().to_string());
            if !existing.contains(&candidate) {
                return candidate;
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

fn random_id(groups: usize) -> String {
    (0..groups)
        .map(|_| {
            let mut bits = Uuid::new_v4().as_u128();
            (0..GROUP_SIZE)
                .map(|_| {
                    let c = ALPHABET[(bits % 36) as usize] as char;
                    bits /= 36;
                    c
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn group_count(text: &str) -> Option<usize> {
    let mut count = 0;
    for group in text.split('-') {
        if group.len() != GROUP_SIZE
            || !group.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        {
            return None;
        }
        count += 1;
    }
    Some(count)
}

fn is_uuid(text: &str) -> bool {
    Uuid::parse_str(text).is_ok_and(|uuid| uuid.hyphenated().to_string() == text)
}

fn is_grouped_id(text: &str) -> bool {
    matches!(group_count(text), Some(n) if n <= MAX_GROUPS)
}

/// Check a human-readable server name.
///
/// Names may not be blank, may not carry surrounding whitespace, and may not
/// contain `-`, `:`, `/`, `\` or control characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "Server name cannot be empty or whitespace".to_string(),
        ));
    }
    if name.trim() != name {
        return Err(Error::InvalidArgument(format!(
            "Server name '{}' has leading or trailing whitespace",
            name
        )));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "Server name is longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '-' | ':' | '/' | '\\') || c.is_control())
    {
        return Err(Error::InvalidArgument(format!(
            "Server name cannot contain {:?}",
            c
        )));
    }
    Ok(())
}
