//! File-backed ACL authorizer.
//!
//! The server authorizes every RPC through a `(subject, object, action)`
//! check. The policy engine proper lives outside the core; this is the
//! minimal allowlist implementation behind the hook, loaded once at boot
//! from a policy file of the form:
//!
//! ```text
//! # subject      object  action
//! p, root,       *,      produce
//! p, root,       *,      consume
//! p, nobody,     *,      consume
//! ```
//!
//! The anonymous subject is the empty string, which a policy can grant
//! rights to like any other. A server constructed with
//! [`Authorizer::allow_all`] skips checks entirely (development mode).

use std::collections::HashSet;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Denial returned by a failed authorization check.
#[derive(Debug, Error)]
#[error("{subject:?} not permitted to {action} to {object}")]
pub struct AuthError {
    pub subject: String,
    pub object: String,
    pub action: String,
}

/// Allowlist over `(subject, object, action)` tuples.
pub struct Authorizer {
    /// `None` means every check passes.
    rules: Option<HashSet<(String, String, String)>>,
}

impl Authorizer {
    /// An authorizer that permits everything.
    pub fn allow_all() -> Self {
        Self { rules: None }
    }

    /// Load rules from a policy file. Blank lines and `#` comments are
    /// skipped; every other line must be `p, subject, object, action`.
    pub fn from_policy_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut rules = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some("p"), Some(subject), Some(object), Some(action)) => {
                    rules.insert((
                        subject.to_string(),
                        object.to_string(),
                        action.to_string(),
                    ));
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed policy line: {line}"),
                    ));
                }
            }
        }
        Ok(Self { rules: Some(rules) })
    }

    /// Check whether `subject` may perform `action` on `object`. A rule
    /// with object `*` matches any object.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError> {
        let Some(rules) = &self.rules else {
            return Ok(());
        };
        let exact = (subject.to_string(), object.to_string(), action.to_string());
        let wildcard = (subject.to_string(), "*".to_string(), action.to_string());
        if rules.contains(&exact) || rules.contains(&wildcard) {
            return Ok(());
        }
        Err(AuthError {
            subject: subject.to_string(),
            object: object.to_string(),
            action: action.to_string(),
        })
    }
}
