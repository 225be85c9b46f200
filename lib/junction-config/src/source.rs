//! Backing sources for config resolution

use crate::{ConfigDocument, ConfigError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// A single configured backing source of configuration documents.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, service: &str, profile: &str) -> Result<ConfigDocument, ConfigError>;

    /// Human-readable description for logs and error detail.
    fn describe(&self) -> String;
}

/// File-tree source: a directory of YAML documents.
///
/// Resolution layers, later overriding earlier:
/// `application.yaml` (shared) <- `{service}.yaml` <- `{service}-{profile}.yaml`.
/// At least one service-specific layer must exist; a service with no
/// document of its own resolves to nothing, which is a hard failure.
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read one layer; `Ok(None)` when the file does not exist.
    async fn read_layer(&self, path: &Path) -> Result<Option<(String, u64)>, ConfigError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::unavailable(format!(
                    "cannot stat {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConfigError::unavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Some((content, mtime)))
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn fetch(&self, service: &str, profile: &str) -> Result<ConfigDocument, ConfigError> {
        let shared = self.root.join("application.yaml");
        let service_layer = self.root.join(format!("{}.yaml", service));
        let profile_layer = self.root.join(format!("{}-{}.yaml", service, profile));

        let mut properties = BTreeMap::new();
        let mut latest_mtime = 0u64;
        let mut service_specific = false;

        for (path, is_service_layer) in [
            (&shared, false),
            (&service_layer, true),
            (&profile_layer, true),
        ] {
            let Some((content, mtime)) = self.read_layer(path).await? else {
                continue;
            };
            merge_yaml_layer(&content, &mut properties).map_err(|detail| {
                ConfigError::unavailable(format!("malformed document {}: {}", path.display(), detail))
            })?;
            latest_mtime = latest_mtime.max(mtime);
            service_specific |= is_service_layer;
            debug!(path = %path.display(), "merged config layer");
        }

        if !service_specific {
            return Err(ConfigError::unavailable(format!(
                "no configuration document for service {} (profile {}) under {}",
                service,
                profile,
                self.root.display()
            )));
        }

        Ok(ConfigDocument::new(
            service,
            profile,
            latest_mtime.to_string(),
            properties,
        ))
    }

    fn describe(&self) -> String {
        format!("file tree at {}", self.root.display())
    }
}

/// Parse one YAML document and flatten its mappings into dotted keys,
/// overriding previously merged values. Empty documents merge nothing.
fn merge_yaml_layer(
    content: &str,
    out: &mut BTreeMap<String, serde_json::Value>,
) -> Result<(), String> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    match value {
        serde_yaml::Value::Null => Ok(()),
        serde_yaml::Value::Mapping(_) => flatten_into("", &value, out),
        other => Err(format!(
            "top level must be a mapping, found {}",
            yaml_kind(&other)
        )),
    }
}

fn flatten_into(
    prefix: &str,
    value: &serde_yaml::Value,
    out: &mut BTreeMap<String, serde_json::Value>,
) -> Result<(), String> {
    match value {
        serde_yaml::Value::Mapping(mapping) => {
            for (key, child) in mapping {
                let key = yaml_key(key)?;
                let child_prefix = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&child_prefix, child, out)?;
            }
            Ok(())
        }
        serde_yaml::Value::Tagged(tagged) => flatten_into(prefix, &tagged.value, out),
        leaf => {
            out.insert(prefix.to_string(), yaml_to_json(leaf)?);
            Ok(())
        }
    }
}

fn yaml_key(key: &serde_yaml::Value) -> Result<String, String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("unsupported mapping key {}", yaml_kind(other))),
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> Result<serde_json::Value, String> {
    Ok(match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| format!("non-finite number {}", f))?
            } else {
                return Err(format!("unrepresentable number {:?}", n));
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => serde_json::Value::Array(
            seq.iter()
                .map(yaml_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut object = serde_json::Map::new();
            for (key, child) in mapping {
                object.insert(yaml_key(key)?, yaml_to_json(child)?);
            }
            serde_json::Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value)?,
    })
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_layers_merge_with_profile_override() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "application.yaml",
            "server:\n  port: 1\ngreeting: hello\n",
        );
        write(&dir, "inventory.yaml", "server:\n  port: 8081\n");
        write(&dir, "inventory-prod.yaml", "greeting: hello-prod\n");

        let source = FileSource::new(dir.path());
        let doc = source.fetch("inventory", "prod").await.unwrap();

        assert_eq!(doc.get("server.port"), Some(&serde_json::json!(8081)));
        assert_eq!(doc.get_str("greeting"), Some("hello-prod"));
        assert_eq!(doc.service, "inventory");
        assert_eq!(doc.profile, "prod");
    }

    #[tokio::test]
    async fn test_profile_layer_alone_is_sufficient() {
        let dir = TempDir::new().unwrap();
        write(&dir, "billing-prod.yaml", "retries: 3\n");

        let source = FileSource::new(dir.path());
        let doc = source.fetch("billing", "prod").await.unwrap();
        assert_eq!(doc.get("retries"), Some(&serde_json::json!(3)));
    }

    #[tokio::test]
    async fn test_missing_service_document_fails_hard() {
        let dir = TempDir::new().unwrap();
        // A shared layer exists, but that alone never satisfies resolution.
        write(&dir, "application.yaml", "greeting: hello\n");

        let source = FileSource::new(dir.path());
        let err = source.fetch("inventory", "default").await.unwrap_err();
        let ConfigError::Unavailable { detail } = err;
        assert!(detail.contains("inventory"));
    }

    #[tokio::test]
    async fn test_malformed_document_fails_hard() {
        let dir = TempDir::new().unwrap();
        write(&dir, "inventory.yaml", "server:\n  port: [unclosed\n");

        let source = FileSource::new(dir.path());
        let err = source.fetch("inventory", "default").await.unwrap_err();
        let ConfigError::Unavailable { detail } = err;
        assert!(detail.contains("inventory.yaml"));
    }

    #[tokio::test]
    async fn test_non_mapping_document_fails_hard() {
        let dir = TempDir::new().unwrap();
        write(&dir, "inventory.yaml", "- just\n- a\n- list\n");

        let source = FileSource::new(dir.path());
        assert!(source.fetch("inventory", "default").await.is_err());
    }

    #[tokio::test]
    async fn test_flatten_preserves_scalar_types() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.yaml",
            "db:\n  pool:\n    size: 10\n  readonly: false\ntags:\n  - fast\n  - internal\n",
        );

        let source = FileSource::new(dir.path());
        let doc = source.fetch("inventory", "default").await.unwrap();
        assert_eq!(doc.get("db.pool.size"), Some(&serde_json::json!(10)));
        assert_eq!(doc.get("db.readonly"), Some(&serde_json::json!(false)));
        assert_eq!(
            doc.get("tags"),
            Some(&serde_json::json!(["fast", "internal"]))
        );
    }
}
