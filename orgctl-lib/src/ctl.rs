//! Account control record
//!
//! A [`Ctl`] is the ownership, description, and tag metadata persisted inside
//! each managed account. It is stored as the description of a well-known IAM
//! role, encoded as `"<version>#" + base64(JSON)`.
//!
//! Tags are a `BTreeSet`, so two equal records always encode to the same
//! bytes. The control store relies on that when it verifies a write by
//! comparing the echoed description with what it sent.

use crate::{OrgError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Current record format version.
pub const CTL_VERSION: u32 = 1;

/// Maximum tag length in bytes.
pub const MAX_TAG_LEN: usize = 64;

/// Names with special meaning in account specs.
pub const RESERVED_NAMES: &[&str] = &["owner", "err"];

/// Returns true if `tag` is a lowercase identifier usable as a tag.
///
/// Tags start with a letter and contain only `a-z`, `0-9`, `_` and `-`.
pub fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= MAX_TAG_LEN
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && !RESERVED_NAMES.contains(&tag)
}

/// Account control record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctl {
    /// Exclusive claimant, `None` when the account is free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Ctl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        self.owner = (!owner.is_empty()).then_some(owner);
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Add tags, rejecting anything that is not a valid tag.
    pub fn with_tags<I, S>(mut self, tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for t in tags {
            self.set_tag(t, true)?;
        }
        Ok(self)
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Set or clear one tag.
    pub fn set_tag(&mut self, tag: impl Into<String>, on: bool) -> Result<()> {
        let tag = tag.into();
        if !valid_tag(&tag) {
            return Err(OrgError::invalid_input(format!("invalid tag: {tag:?}")));
        }
        if on {
            self.tags.insert(tag);
        } else {
            self.tags.remove(&tag);
        }
        Ok(())
    }

    /// Encode as `"1#" + base64(JSON)`.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{CTL_VERSION}#{}", BASE64.encode(json)))
    }

    /// Decode a record produced by [`Ctl::encode`].
    pub fn decode(s: &str) -> Result<Self> {
        let (ver, body) = s
            .split_once('#')
            .ok_or_else(|| OrgError::codec("missing version prefix"))?;
        let ver: u32 = ver
            .parse()
            .map_err(|_| OrgError::codec(format!("invalid version {ver:?}")))?;
        if ver != CTL_VERSION {
            return Err(OrgError::codec(format!("unsupported version {ver}")));
        }
        let raw = BASE64
            .decode(body.trim())
            .map_err(|e| OrgError::codec(format!("invalid base64: {e}")))?;
        let mut ctl: Ctl = serde_json::from_slice(&raw)
            .map_err(|e| OrgError::codec(format!("invalid JSON: {e}")))?;
        ctl.owner = ctl.owner.filter(|o| !o.is_empty());
        Ok(ctl)
    }

    /// Three-way merge of local state `self` (want) into `cur`, relative to
    /// the last confirmed value `reference`.
    ///
    /// A field that still equals `reference` was not changed locally and takes
    /// `cur`'s value. A field that differs is a local edit and wins. Tags merge
    /// as sets: local removals are removed from `cur`, local additions added.
    pub fn merge(&self, cur: &Ctl, reference: &Ctl) -> Ctl {
        fn pick<T: PartialEq + Clone>(want: &T, cur: &T, reference: &T) -> T {
            if want == reference {
                cur.clone()
            } else {
                want.clone()
            }
        }
        let removed: BTreeSet<&String> = reference.tags.difference(&self.tags).collect();
        let tags = cur
            .tags
            .iter()
            .filter(|t| !removed.contains(t))
            .chain(self.tags.difference(&reference.tags))
            .cloned()
            .collect();
        Ctl {
            owner: pick(&self.owner, &cur.owner, &reference.owner),
            desc: pick(&self.desc, &cur.desc, &reference.desc),
            tags,
        }
    }
}

impl fmt::Display for Ctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner={}", self.owner().unwrap_or("-"))?;
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            write!(f, " tags={}", tags.join(","))?;
        }
        if !self.desc.is_empty() {
            write!(f, " desc={:?}", self.desc)?;
        }
        Ok(())
    }
}
