//! Key/value configuration backed by a YAML document.
//!
//! Keys are dotted paths into nested mappings, so `devices.gpus` reads
//!
//! ```yaml
//! devices:
//!   gpus: /dev/nvidia0,/dev/nvidia1
//! ```

use std::io;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde_yaml::Value;
use thiserror::Error;

/// Errors raised while loading or querying the plugin configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    MissingFile { path: String },
    #[error("configuration file could not be read: {path}")]
    Unreadable { path: String },
    #[error("configuration key `{key}` is missing")]
    MissingKey { key: String },
    #[error("invalid configuration: {message}")]
    Parse { message: String },
}

#[derive(Debug, Clone)]
pub struct ConfigProvider {
    root: Value,
}

impl ConfigProvider {
    /// Load the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingFile`] if the file does not exist
    /// - [`ConfigError::Unreadable`] if the file exists but cannot be read
    /// - [`ConfigError::Parse`] if the content is not a YAML mapping
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report<ConfigError>> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Report::new(e).change_context(ConfigError::MissingFile {
                    path: path.display().to_string(),
                }));
            }
            Err(e) => {
                return Err(Report::new(e).change_context(ConfigError::Unreadable {
                    path: path.display().to_string(),
                }));
            }
        };

        tracing::info!("Loading plugin config '{}'", path.display());
        Self::from_yaml_str(&content)
            .attach_printable_lazy(|| format!("config file: {}", path.display()))
    }

    /// Parse configuration from YAML text. An empty document is an empty configuration.
    pub fn from_yaml_str(content: &str) -> Result<Self, Report<ConfigError>> {
        let root: Value = serde_yaml::from_str(content).change_context(ConfigError::Parse {
            message: "not valid YAML".to_string(),
        })?;

        match root {
            Value::Null => Ok(Self {
                root: Value::Mapping(Default::default()),
            }),
            Value::Mapping(_) => Ok(Self { root }),
            _ => Err(Report::new(ConfigError::Parse {
                message: "top level must be a mapping".to_string(),
            })),
        }
    }

    /// Look up a required string value.
    ///
    /// Numbers and booleans are rendered as strings, and a sequence of scalars
    /// is joined with commas so list settings can be written either way.
    pub fn string(&self, key: &str) -> Result<String, Report<ConfigError>> {
        let value = self.lookup(key).ok_or_else(|| {
            Report::new(ConfigError::MissingKey {
                key: key.to_string(),
            })
        })?;

        render(value).ok_or_else(|| {
            Report::new(ConfigError::Parse {
                message: format!("key `{key}` does not hold a string value"),
            })
        })
    }

    /// Look up a string value, falling back to `default` when the key is absent.
    pub fn string_or(&self, key: &str, default: &str) -> Result<String, Report<ConfigError>> {
        match self.lookup(key) {
            Some(_) => self.string(key),
            None => Ok(default.to_string()),
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |value, segment| value.get(segment))
            .filter(|value| !value.is_null())
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Sequence(items) => items
            .iter()
            .map(render)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"
devices:
  gpus: /dev/nvidia0,/dev/nvidia1
  sidekicks:
    - /dev/nvidiactl
    - /dev/nvidia-uvm
environment:
  libs: LD_LIBRARY_PATH=/usr/local/nvidia/lib64
mounts:
  retries: 3
"#;

    #[test]
    fn nested_keys_resolve_to_strings() {
        let cfg = ConfigProvider::from_yaml_str(SAMPLE).expect("should parse");

        assert_eq!(
            cfg.string("devices.gpus").expect("key present"),
            "/dev/nvidia0,/dev/nvidia1"
        );
        assert_eq!(
            cfg.string("environment.libs").expect("key present"),
            "LD_LIBRARY_PATH=/usr/local/nvidia/lib64"
        );
        assert_eq!(cfg.string("mounts.retries").expect("key present"), "3");
    }

    #[test]
    fn sequences_are_joined_with_commas() {
        let cfg = ConfigProvider::from_yaml_str(SAMPLE).expect("should parse");

        assert_eq!(
            cfg.string("devices.sidekicks").expect("key present"),
            "/dev/nvidiactl,/dev/nvidia-uvm"
        );
    }

    #[test]
    fn missing_key_is_reported_by_name() {
        let cfg = ConfigProvider::from_yaml_str(SAMPLE).expect("should parse");

        let err = cfg.string("mounts.libs").expect_err("key is absent");
        assert!(matches!(
            err.current_context(),
            ConfigError::MissingKey { key } if key == "mounts.libs"
        ));
    }

    #[test]
    fn string_or_falls_back_to_default() {
        let cfg = ConfigProvider::from_yaml_str(SAMPLE).expect("should parse");

        assert_eq!(cfg.string_or("mounts.bins", "").expect("default"), "");
        assert_eq!(
            cfg.string_or("devices.gpus", "fallback").expect("present"),
            "/dev/nvidia0,/dev/nvidia1"
        );
    }

    #[test]
    fn mapping_value_is_not_a_string() {
        let cfg = ConfigProvider::from_yaml_str(SAMPLE).expect("should parse");

        let err = cfg.string("devices").expect_err("devices is a mapping");
        assert!(matches!(err.current_context(), ConfigError::Parse { .. }));
    }

    #[test]
    fn empty_document_is_empty_config() {
        let cfg = ConfigProvider::from_yaml_str("").expect("empty document should parse");

        assert!(cfg.string("devices.gpus").is_err());
    }

    #[test]
    fn scalar_document_is_rejected() {
        let err = ConfigProvider::from_yaml_str("just a string").expect_err("not a mapping");
        assert!(matches!(err.current_context(), ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = NamedTempFile::new().expect("should create temp file");
        file.write_all(SAMPLE.as_bytes()).expect("should write config");

        let cfg = ConfigProvider::load(file.path()).expect("should load");
        assert!(cfg.string("devices.gpus").is_ok());
    }

    #[test]
    fn load_missing_file_is_distinct_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");

        let err = ConfigProvider::load(dir.path().join("absent.yml")).expect_err("no file");
        assert!(matches!(
            err.current_context(),
            ConfigError::MissingFile { .. }
        ));
    }
}
