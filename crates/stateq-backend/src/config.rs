//! User configuration.
//!
//! The configuration file is a free-form tree queried by dotted keys
//! (`cache.clean`, `svq.org`). When a namespace is set, usually the command
//! name, `<namespace>.<key>` is looked up before the bare key.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::env::EnvLookup;
use crate::error::{BackendError, BackendResult};

/// Environment variable naming the configuration file explicitly.
pub const CONFIG_FILE_VAR: &str = "STATEQ_CFG_FILE";
/// File looked up in the platform configuration directory.
pub const CONFIG_FILE_NAME: &str = "stateq.yaml";

/// Loaded configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryConfig {
    source: Option<PathBuf>,
    namespace: Option<String>,
    data: Value,
}

impl QueryConfig {
    /// An empty configuration: every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap an in-memory tree.
    pub fn from_value(data: Value) -> Self {
        Self {
            source: None,
            namespace: None,
            data,
        }
    }

    /// Load a YAML, TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> BackendResult<Self> {
        let fail = |reason: String| BackendError::Config {
            path: path.display().to_string(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let data: Value = match ext.to_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| fail(e.to_string()))?,
            "toml" => toml::from_str(&contents).map_err(|e| fail(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| fail(e.to_string()))?,
            _ => return Err(fail(format!("unsupported config file extension: {ext}"))),
        };

        debug!("loaded config file: {}", path.display());
        Ok(Self {
            source: Some(path.to_path_buf()),
            namespace: None,
            data,
        })
    }

    /// Find and load the configuration file.
    ///
    /// `STATEQ_CFG_FILE` must point at an existing regular file when set.
    /// Otherwise `<config dir>/stateq.yaml` is used if present, else the
    /// configuration is empty.
    pub fn locate(env: &dyn EnvLookup) -> BackendResult<Self> {
        if let Some(explicit) = env.non_empty(CONFIG_FILE_VAR) {
            let path = PathBuf::from(&explicit);
            return match std::fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => Err(BackendError::Config {
                    path: explicit,
                    reason: format!("{CONFIG_FILE_VAR} points to a directory"),
                }),
                Ok(_) => Self::from_file(&path),
                Err(_) => Err(BackendError::Config {
                    path: explicit,
                    reason: format!("config file not found at {CONFIG_FILE_VAR} path"),
                }),
            };
        }

        match env.config_dir().map(|d| d.join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => {
                debug!("no config file found, using empty config");
                Ok(Self::empty())
            }
        }
    }

    /// Set the namespace tried before bare keys.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let ns = namespace.into();
        self.namespace = (!ns.is_empty()).then_some(ns);
        self
    }

    /// File this configuration was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Current namespace.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Raw value at `key`, namespaced key first.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(ns) = &self.namespace {
            if let Some(v) = lookup(&self.data, &format!("{ns}.{key}")) {
                return Some(v);
            }
        }
        lookup(&self.data, key)
    }

    /// String value at `key`. Non-string values miss.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// Integer value at `key`. Floats are truncated; other types miss.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
    }
}

fn lookup<'a>(data: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(data, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_dotted_lookup() {
        let cfg = QueryConfig::from_value(json!({
            "org": "acme",
            "cache": { "clean": 24 },
            "sq": { "org": "sq-org" }
        }));
        assert_eq!(cfg.get_string("org").as_deref(), Some("acme"));
        assert_eq!(cfg.get_int("cache.clean"), Some(24));
        assert_eq!(cfg.get_int("cache.missing"), None);
        assert_eq!(cfg.get_string("cache"), None);
    }

    #[test]
    fn test_namespace_preferred_then_bare() {
        let cfg = QueryConfig::from_value(json!({
            "org": "acme",
            "host": "tfe.example.com",
            "sq": { "org": "sq-org" }
        }))
        .with_namespace("sq");
        assert_eq!(cfg.get_string("org").as_deref(), Some("sq-org"));
        assert_eq!(cfg.get_string("host").as_deref(), Some("tfe.example.com"));
        assert_eq!(cfg.namespace(), Some("sq"));
    }

    #[test]
    fn test_float_truncates_to_int() {
        let cfg = QueryConfig::from_value(json!({ "cache": { "clean": 1.9 } }));
        assert_eq!(cfg.get_int("cache.clean"), Some(1));
    }

    #[test]
    fn test_from_file_formats() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("c.yaml");
        std::fs::write(&yaml, "org: acme\ncache:\n  clean: 12\n").unwrap();
        let toml_file = dir.path().join("c.toml");
        std::fs::write(&toml_file, "org = \"acme\"\n[cache]\nclean = 12\n").unwrap();
        let json_file = dir.path().join("c.json");
        std::fs::write(&json_file, r#"{"org":"acme","cache":{"clean":12}}"#).unwrap();

        for path in [yaml, toml_file, json_file] {
            let cfg = QueryConfig::from_file(&path).unwrap();
            assert_eq!(cfg.get_string("org").as_deref(), Some("acme"));
            assert_eq!(cfg.get_int("cache.clean"), Some(12));
            assert_eq!(cfg.source(), Some(path.as_path()));
        }
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.ini");
        std::fs::write(&path, "org=acme").unwrap();
        assert!(matches!(
            QueryConfig::from_file(&path),
            Err(BackendError::Config { .. })
        ));
    }

    #[test]
    fn test_locate_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mine.yaml");
        std::fs::write(&path, "org: explicit\n").unwrap();
        let env = MapEnv::new().with_var(CONFIG_FILE_VAR, path.to_str().unwrap());
        let cfg = QueryConfig::locate(&env).unwrap();
        assert_eq!(cfg.get_string("org").as_deref(), Some("explicit"));
    }

    #[test]
    fn test_locate_explicit_directory_or_missing_errors() {
        let dir = TempDir::new().unwrap();
        let env = MapEnv::new().with_var(CONFIG_FILE_VAR, dir.path().to_str().unwrap());
        let err = QueryConfig::locate(&env).unwrap_err();
        assert!(err.to_string().contains("directory"));

        let missing = dir.path().join("nope.yaml");
        let env = MapEnv::new().with_var(CONFIG_FILE_VAR, missing.to_str().unwrap());
        assert!(QueryConfig::locate(&env).is_err());
    }

    #[test]
    fn test_locate_config_dir_then_empty() {
        let dir = TempDir::new().unwrap();
        let env = MapEnv::new().with_config_dir(dir.path());
        assert_eq!(QueryConfig::locate(&env).unwrap(), QueryConfig::empty());

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "workspace: net\n").unwrap();
        let cfg = QueryConfig::locate(&env).unwrap();
        assert_eq!(cfg.get_string("workspace").as_deref(), Some("net"));
    }
}
