//! Key generation and handling.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Placeholder for a dimension a limit does not distinguish on.
///
/// The tilde keeps it from colliding with real identifiers.
pub const ANY: &str = "~any";

/// An opaque identifier for one rate-limited subject.
///
/// Keys are cheap to clone; the text is shared behind an `Arc`. A composite
/// key is serialized once at construction in the order its parts were given,
/// so two keys built from the same parts compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Arc<str>);

impl Key {
    /// Create a key from a plain identifier such as a user id, IP or token.
    pub fn new(key: impl AsRef<str>) -> Self {
        Key(Arc::from(key.as_ref()))
    }

    /// Create a key from labelled parts, e.g. `[("app", "a"), ("user", "42")]`.
    pub fn composite<I, K, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries: Vec<String> = parts
            .into_iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect();

        Key(Arc::from(entries.join(",")))
    }

    /// Prefix this key with a namespace, keeping state for different limits apart.
    pub fn namespaced(&self, namespace: &str) -> Self {
        Key(Arc::from(format!("LIMIT:{}:{}", namespace, self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::new(key)
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key(Arc::from(key))
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
