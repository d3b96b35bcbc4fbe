//! Content-addressed fingerprints for analysis requests.
//!
//! A fingerprint depends only on the *set* of input descriptors (name, size,
//! modification time), the language hint when one is given, and optionally
//! the objective and the specialist set. Input order never matters: items and specialists are sorted before
//! hashing.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DedupConfig;

/// Metadata that identifies one input file for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
        }
    }

    fn canonical(&self) -> String {
        format!(
            "{}:{}:{}",
            self.name,
            self.size,
            self.modified.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Base64 SHA-256 digest of a canonicalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which request attributes participate in the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintOptions {
    pub include_objective: bool,
    pub include_agents: bool,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        Self {
            include_objective: true,
            include_agents: true,
        }
    }
}

impl From<&DedupConfig> for FingerprintOptions {
    fn from(config: &DedupConfig) -> Self {
        Self {
            include_objective: config.include_objective,
            include_agents: config.include_agents,
        }
    }
}

/// Canonical text hashed by [`fingerprint`].
///
/// Items are sorted by name, then size, then modification time and joined
/// with `|`. A language hint follows as `language=` whenever it is set, since
/// it changes extraction output. Objective and specialists follow as
/// `objective=` / `agents=` segments when enabled.
pub fn canonical_form<S: AsRef<str>>(
    items: &[FileDescriptor],
    objective: Option<&str>,
    language_hint: Option<&str>,
    agents: &[S],
    opts: FingerprintOptions,
) -> String {
    let mut sorted: Vec<&FileDescriptor> = items.iter().collect();
    sorted.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then(a.size.cmp(&b.size))
            .then(a.modified.cmp(&b.modified))
    });

    let mut out = sorted
        .iter()
        .map(|item| item.canonical())
        .collect::<Vec<_>>()
        .join("|");

    if let Some(hint) = language_hint.map(str::trim).filter(|h| !h.is_empty()) {
        out.push_str("\nlanguage=");
        out.push_str(hint);
    }
    if opts.include_objective {
        out.push_str("\nobjective=");
        out.push_str(objective.unwrap_or_default());
    }
    if opts.include_agents {
        let mut names: Vec<String> = agents
            .iter()
            .map(|a| a.as_ref().trim().to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        out.push_str("\nagents=");
        out.push_str(&names.join(","));
    }
    out
}

/// Compute the dedup fingerprint of a request.
pub fn fingerprint<S: AsRef<str>>(
    items: &[FileDescriptor],
    objective: Option<&str>,
    language_hint: Option<&str>,
    agents: &[S],
    opts: FingerprintOptions,
) -> Fingerprint {
    let canonical = canonical_form(items, objective, language_hint, agents, opts);
    let digest = Sha256::digest(canonical.as_bytes());
    Fingerprint(BASE64.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn files() -> Vec<FileDescriptor> {
        vec![
            FileDescriptor::new("Billing.java", 4_096, at(0)),
            FileDescriptor::new("ledger.go", 1_024, at(10)),
            FileDescriptor::new("report.py", 512, at(20)),
        ]
    }

    #[test]
    fn test_order_independent() {
        let mut reversed = files();
        reversed.reverse();
        let opts = FingerprintOptions::default();
        assert_eq!(
            fingerprint(&files(), Some("modernize"), None, &["security", "performance"], opts),
            fingerprint(&reversed, Some("modernize"), None, &["performance", "security"], opts),
        );
    }

    #[test]
    fn test_sensitive_to_content_metadata() {
        let opts = FingerprintOptions::default();
        let base = fingerprint(&files(), None, None, &["security"], opts);

        let mut resized = files();
        resized[1].size += 1;
        assert_ne!(base, fingerprint(&resized, None, None, &["security"], opts));

        let mut touched = files();
        touched[2].modified = at(21);
        assert_ne!(base, fingerprint(&touched, None, None, &["security"], opts));

        let mut renamed = files();
        renamed[0].name = "Invoice.java".into();
        assert_ne!(base, fingerprint(&renamed, None, None, &["security"], opts));
    }

    #[test]
    fn test_objective_and_agents_toggle() {
        let on = FingerprintOptions::default();
        assert_ne!(
            fingerprint(&files(), Some("a"), None, &["security"], on),
            fingerprint(&files(), Some("b"), None, &["security"], on),
        );
        assert_ne!(
            fingerprint(&files(), None, None, &["security"], on),
            fingerprint(&files(), None, None, &["security", "architecture"], on),
        );

        let off = FingerprintOptions {
            include_objective: false,
            include_agents: false,
        };
        assert_eq!(
            fingerprint(&files(), Some("a"), None, &["security"], off),
            fingerprint(&files(), Some("b"), None, &["architecture"], off),
        );
    }

    #[test]
    fn test_canonical_form_layout() {
        let items = vec![FileDescriptor::new("b.go", 2, at(0)), FileDescriptor::new("a.py", 1, at(0))];
        let text = canonical_form(&items, Some("review"), None, &["Security", "architecture"], FingerprintOptions::default());
        assert_eq!(
            text,
            "a.py:1:2023-11-14T22:13:20.000Z|b.go:2:2023-11-14T22:13:20.000Z\nobjective=review\nagents=architecture,security"
        );
    }

    #[test]
    fn test_digest_is_base64_sha256() {
        let fp = fingerprint::<&str>(&[], None, None, &[], FingerprintOptions::default());
        // 32-byte digest -> 44 base64 chars with padding
        assert_eq!(fp.as_str().len(), 44);
        assert!(fp.as_str().ends_with('='));
    }

    #[test]
    fn test_language_hint_changes_fingerprint() {
        let opts = FingerprintOptions {
            include_objective: false,
            include_agents: false,
        };
        let plain = fingerprint(&files(), None, None, &["security"], opts);
        let java = fingerprint(&files(), None, Some("java"), &["security"], opts);
        let go = fingerprint(&files(), None, Some("go"), &["security"], opts);
        assert_ne!(plain, java);
        assert_ne!(java, go);
        assert_eq!(plain, fingerprint(&files(), None, Some("  "), &["security"], opts));

        let items = vec![FileDescriptor::new("a.py", 1, at(0))];
        let text = canonical_form::<&str>(&items, None, Some("python"), &[], opts);
        assert_eq!(text, "a.py:1:2023-11-14T22:13:20.000Z\nlanguage=python");
    }
}
