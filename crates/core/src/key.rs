//! Object addressing.
//!
//! A key has three string forms:
//! - canonical `group/version/kind/account/name` (also the URL path form),
//! - bus subject segments joined by `.`,
//! - CLI shorthand `kind` or `kind.name`.
//!
//! Empty segments are wildcards and are rendered as `*`.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StrataError;

pub const WILDCARD: &str = "*";

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex"))
}

/// Uniquely addresses one object. Empty fields act as wildcards in filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub name: String,
}

/// Event channel: one per (group, kind, account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub group: String,
    pub kind: String,
    pub account: String,
}

impl ObjectKey {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        account: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            account: account.into(),
            name: name.into(),
        }
    }

    fn segments(&self) -> [&str; 5] {
        [&self.group, &self.version, &self.kind, &self.account, &self.name]
    }

    /// Segments with wildcards rendered as `*`.
    pub fn rendered_segments(&self) -> [&str; 5] {
        self.segments().map(|s| if s.is_empty() { WILDCARD } else { s })
    }

    /// Require every segment to be concrete and well formed.
    pub fn validate_strict(&self) -> Result<(), StrataError> {
        let labels = ["group", "version", "kind", "account", "name"];
        let mut problems = Vec::new();
        for (label, seg) in labels.iter().zip(self.segments()) {
            if seg.is_empty() || seg == WILDCARD {
                problems.push(format!("{label} is required"));
            } else if !segment_re().is_match(seg) {
                problems.push(format!("{label} {seg:?} must match [a-zA-Z0-9_-]+"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(StrataError::Validation(format!("invalid key {self}: {}", problems.join(", "))))
        }
    }

    /// Filters may leave segments empty, but any given segment must be well formed.
    pub fn validate_filter(&self) -> Result<(), StrataError> {
        for seg in self.segments() {
            if !seg.is_empty() && seg != WILDCARD && !segment_re().is_match(seg) {
                return Err(StrataError::Validation(format!("invalid key segment {seg:?}")));
            }
        }
        Ok(())
    }

    pub fn is_concrete(&self) -> bool {
        self.segments().iter().all(|s| !s.is_empty() && *s != WILDCARD)
    }

    /// Wildcard match: empty segments in `filter` match anything.
    pub fn matches(&self, filter: &ObjectKey) -> bool {
        self.segments()
            .iter()
            .zip(filter.segments())
            .all(|(mine, theirs)| theirs.is_empty() || theirs == WILDCARD || *mine == theirs)
    }

    pub fn channel(&self) -> ChannelKey {
        ChannelKey { group: self.group.clone(), kind: self.kind.clone(), account: self.account.clone() }
    }

    /// Bus subject form: `group.version.kind.account.name`.
    pub fn subject(&self) -> String {
        self.rendered_segments().join(".")
    }

    /// Build a key from the five trailing segments of a subject or path.
    pub fn from_parts(parts: &[&str]) -> Result<Self, StrataError> {
        match parts {
            [group, version, kind, account, name] => {
                let take = |s: &str| if s == WILDCARD { String::new() } else { s.to_string() };
                Ok(Self {
                    group: take(group),
                    version: take(version),
                    kind: take(kind),
                    account: take(account),
                    name: take(name),
                })
            }
            _ => Err(StrataError::Validation(format!(
                "invalid key: expected 5 segments, got {}",
                parts.len()
            ))),
        }
    }

    /// Parse CLI shorthand `kind` or `kind.name`.
    pub fn from_shorthand(s: &str) -> Result<Self, StrataError> {
        let (kind, name) = match s.split_once('.') {
            Some((k, n)) => (k, n),
            None => (s, ""),
        };
        if kind.is_empty() || name.contains('.') {
            return Err(StrataError::Validation(format!(
                "invalid shorthand {s:?} (expect kind or kind.name)"
            )));
        }
        let key = Self { kind: kind.to_string(), name: name.to_string(), ..Self::default() };
        key.validate_filter()?;
        Ok(key)
    }

    /// CLI shorthand rendering, inverse of [`ObjectKey::from_shorthand`].
    pub fn shorthand(&self) -> String {
        if self.name.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.name)
        }
    }

    /// `apiVersion` value as carried in payloads.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered_segments().join("/"))
    }
}

impl FromStr for ObjectKey {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let key = Self::from_parts(&parts)?;
        key.validate_filter()?;
        Ok(key)
    }
}
