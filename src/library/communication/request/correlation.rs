use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Token linking a [`Request`](super::Request) to its [`Reply`](super::Reply)
///
/// Identifiers are opaque to everyone but the requestor that generated them and are copied
/// verbatim by the responding side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a new random identifier that is unique across processes
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String representation as carried in message metadata
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generate_distinct_identifiers() {
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn keep_foreign_identifiers_verbatim() {
        let id = CorrelationId::from("not-a-uuid");

        assert_eq!(id.as_str(), "not-a-uuid");
        assert_eq!(id.to_string(), "not-a-uuid");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""not-a-uuid""#);
    }
}
