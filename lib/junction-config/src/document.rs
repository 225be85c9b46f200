//! Resolved configuration documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The configuration resolved for one `(service, profile)` pair.
///
/// Immutable once resolved. `version` and `resolved_at` are provenance for
/// operators; nothing invalidates a document after the fact because
/// resolution happens exactly once per service startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub service: String,
    pub profile: String,
    pub version: String,
    pub resolved_at: DateTime<Utc>,
    /// Flattened properties under dotted keys, e.g. `server.port`.
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ConfigDocument {
    pub fn new(
        service: impl Into<String>,
        profile: impl Into<String>,
        version: impl Into<String>,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            service: service.into(),
            profile: profile.into(),
            version: version.into(),
            resolved_at: Utc::now(),
            properties,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|value| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lookup() {
        let mut properties = BTreeMap::new();
        properties.insert("server.port".to_string(), serde_json::json!(8081));
        properties.insert("greeting".to_string(), serde_json::json!("hello"));

        let doc = ConfigDocument::new("inventory", "prod", "42", properties);
        assert_eq!(doc.get("server.port"), Some(&serde_json::json!(8081)));
        assert_eq!(doc.get_str("greeting"), Some("hello"));
        assert_eq!(doc.get("missing"), None);
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_document_round_trips_as_json() {
        let mut properties = BTreeMap::new();
        properties.insert("flag".to_string(), serde_json::json!(true));
        let doc = ConfigDocument::new("inventory", "default", "1", properties);

        let encoded = serde_json::to_string(&doc).unwrap();
        let decoded: ConfigDocument = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.service, "inventory");
        assert_eq!(decoded.get("flag"), Some(&serde_json::json!(true)));
    }
}
