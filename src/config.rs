use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::error::IpamError;
use crate::ip::predefined;
use crate::ipam::{Allocator, AllocatorOptions, DiscoveryType, RetryPolicy};
use crate::store::{new_store, DatastoreConfigData, Scope, StoreConfig};

/// Top-level configuration structure that mirrors the YAML configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backing store of the local address space
    #[serde(default)]
    pub store: StoreConfig,
    /// (Optional) Backing store of the global address space, bound at start-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_store: Option<StoreConfig>,
    /// (Optional) Retry cap and backoff for store conflicts (default: unbounded)
    #[serde(default)]
    pub retry: RetryPolicy,
    /// (Optional) Replacement predefined pool catalogs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined: Option<PredefinedCatalogs>,
    /// (Optional) Log filter used when RUST_LOG is unset (default: "info")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Catalog overrides; an omitted list keeps the built-in catalog
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PredefinedCatalogs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Vec<String>>,
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid store configuration: {0}")]
    InvalidStore(String),
    #[error("Invalid predefined catalog: {0}")]
    InvalidCatalog(String),
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        for store in std::iter::once(&self.store).chain(self.global_store.iter()) {
            if let StoreConfig::File { path } = store {
                if path.as_os_str().is_empty() {
                    return Err(ValidationError::InvalidStore("file store path cannot be empty".to_string()));
                }
            }
        }

        if self.retry.max_attempts == Some(0) {
            return Err(ValidationError::InvalidRetry("max_attempts must be at least 1".to_string()));
        }

        if let Some(catalogs) = &self.predefined {
            for list in [&catalogs.local, &catalogs.global].into_iter().flatten() {
                predefined::parse_catalog(list).map_err(|e| ValidationError::InvalidCatalog(e.to_string()))?;
            }
        }

        Ok(())
    }

    fn allocator_options(&self) -> Result<AllocatorOptions, ValidationError> {
        let mut options = AllocatorOptions { retry: self.retry.clone(), ..AllocatorOptions::default() };
        if let Some(catalogs) = &self.predefined {
            if let Some(local) = &catalogs.local {
                options.local_catalog =
                    predefined::parse_catalog(local).map_err(|e| ValidationError::InvalidCatalog(e.to_string()))?;
            }
            if let Some(global) = &catalogs.global {
                options.global_catalog =
                    predefined::parse_catalog(global).map_err(|e| ValidationError::InvalidCatalog(e.to_string()))?;
            }
        }
        Ok(options)
    }

    /// Open the configured stores and build an allocator over them.
    ///
    /// The global store, when configured, is announced through the same
    /// discovery path a runtime store notification takes.
    pub fn build_allocator(&self) -> Result<Allocator> {
        let options = self.allocator_options()?;
        let local = new_store(&DatastoreConfigData { scope: Scope::Local, config: self.store.clone() })
            .wrap_err("Failed to open local store")?;
        let allocator = Allocator::with_options(Some(local), None, options)?;

        if let Some(global) = &self.global_store {
            let data = DatastoreConfigData { scope: Scope::Global, config: global.clone() };
            allocator
                .discover_new(DiscoveryType::DatastoreConfig, &data)
                .wrap_err("Failed to bind global store")?;
        }
        Ok(allocator)
    }
}

/// Load and parse configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<Config> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open configuration file '{}'", config_path.display()))?;
    let config: Config = serde_yaml::from_reader(file)?;

    config.validate()?;

    Ok(config)
}

/// Allocator over a fresh in-memory store and built-in catalogs
pub fn default_allocator() -> Result<Allocator, IpamError> {
    let local = new_store(&DatastoreConfigData { scope: Scope::Local, config: StoreConfig::Memory })?;
    Allocator::new(Some(local), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_load_minimal_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{{}}").unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.global_store.is_none());
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
store:
  backend: file
  path: /tmp/netpool-local
global_store:
  backend: memory
retry:
  max_attempts: 10
  backoff: 5ms
predefined:
  local:
    - 10.200.0.0/16
    - fd00:aa::/64
log_level: debug
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert!(matches!(config.store, StoreConfig::File { .. }));
        assert_eq!(config.global_store, Some(StoreConfig::Memory));
        assert_eq!(config.retry.max_attempts, Some(10));
        assert_eq!(config.retry.backoff, Duration::from_millis(5));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_validate_rejects_bad_catalog() {
        let config = Config {
            predefined: Some(PredefinedCatalogs { local: Some(vec!["not-a-cidr".to_string()]), global: None }),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidCatalog(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = Config { retry: RetryPolicy::bounded(0), ..Config::default() };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRetry(_))));
    }

    #[test]
    fn test_build_allocator_with_catalog_override() {
        let config = Config {
            predefined: Some(PredefinedCatalogs { local: Some(vec!["fd00:aa::/64".to_string()]), global: None }),
            ..Config::default()
        };
        let allocator = config.build_allocator().unwrap();
        let alloc = allocator.request_pool("LocalDefault", "", "", &HashMap::new(), true).unwrap();
        assert_eq!(alloc.pool.to_string(), "fd00:aa::/64");
    }

    #[test]
    fn test_build_allocator_binds_global_file_store() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            global_store: Some(StoreConfig::File { path: dir.path().join("global") }),
            ..Config::default()
        };
        let allocator = config.build_allocator().unwrap();
        let alloc = allocator.request_pool("GlobalDefault", "", "", &HashMap::new(), false).unwrap();
        assert_eq!(alloc.pool.to_string(), "10.0.0.0/24");
        assert!(dir.path().join("global").join("entries").read_dir().unwrap().count() >= 2);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config(Path::new("/definitely/not/here.yaml")).is_err());
    }
}
