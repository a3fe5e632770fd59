//! Configuration management
//!
//! Settings come from `DSS_*` environment variables (optionally seeded from a
//! `.env` file) with the defaults below.

use crate::policy::RollbackPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Root under which every data directory lives unless set individually.
pub const DEFAULT_DATA_ROOT: &str = "./dss-data";

/// Seconds an incoming entry must stay unchanged before it is picked up.
pub const DEFAULT_QUIET_PERIOD_SECS: u64 = 5;

/// Seconds between two scans of the incoming directory.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;

/// Default registry URL for local development.
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8888";

/// Timeout for one registry request.
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 60;

/// Space used by the default registration details factory.
pub const DEFAULT_SPACE: &str = "DEFAULT";

/// Data set type used by the default registration details factory.
pub const DEFAULT_DATA_SET_TYPE: &str = "UNKNOWN";

/// Prefix of the flat property set handed to the storage processor.
pub const PROCESSOR_PROPERTY_PREFIX: &str = "DSS_PROCESSOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistratorConfig {
    pub directories: DirectoryConfig,
    pub drop_box: DropBoxConfig,
    pub registry: RegistryConfig,
    pub hooks: HookConfig,
    pub details: DetailsConfig,
    /// Plugin-specific storage processor settings, keys lowercased
    pub processor_properties: BTreeMap<String, String>,
    /// Undo table overrides, `class@progress=action,...`
    pub on_error_overrides: Option<String>,
    /// Operator address for storage processor notifications
    pub notify_recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub incoming: PathBuf,
    pub staging: PathBuf,
    pub precommit: PathBuf,
    pub store: PathBuf,
    pub error: PathBuf,
    pub registration_log: PathBuf,
}

impl DirectoryConfig {
    /// Standard layout below one root directory
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            incoming: root.join("incoming"),
            staging: root.join("staging"),
            precommit: root.join("precommit"),
            store: root.join("store"),
            error: root.join("error"),
            registration_log: root.join("registration-log"),
        }
    }

    fn named(&self) -> [(&'static str, &Path); 6] {
        [
            ("incoming", self.incoming.as_path()),
            ("staging", self.staging.as_path()),
            ("precommit", self.precommit.as_path()),
            ("store", self.store.as_path()),
            ("error", self.error.as_path()),
            ("registration log", self.registration_log.as_path()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropBoxConfig {
    /// Deliveries are signalled by `.MARKER_is_finished_<name>` files
    pub use_marker_files: bool,
    pub quiet_period_secs: u64,
    pub scan_interval_secs: u64,
    pub handler: HandlerKind,
}

/// How a delivery is turned into data sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// One plain data set per delivery
    Plain,
    /// A directory delivery becomes a container with one child per entry
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    Http,
    /// Process-local registry, for dry runs
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    pub pre_registration: Option<PathBuf>,
    pub post_registration: Option<PathBuf>,
    pub pre_delivery: Option<PathBuf>,
    pub post_delivery: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsConfig {
    pub space: String,
    pub data_set_type: String,
}

impl Default for RegistratorConfig {
    fn default() -> Self {
        Self::for_root(DEFAULT_DATA_ROOT)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, value)),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("{} must be a boolean, got '{}'", name, value),
        },
        Err(_) => Ok(None),
    }
}

impl RegistratorConfig {
    /// Default settings with every directory below `root`
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        Self {
            directories: DirectoryConfig::under(root),
            drop_box: DropBoxConfig {
                use_marker_files: false,
                quiet_period_secs: DEFAULT_QUIET_PERIOD_SECS,
                scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
                handler: HandlerKind::Plain,
            },
            registry: RegistryConfig {
                mode: RegistryMode::Http,
                url: DEFAULT_REGISTRY_URL.to_string(),
                timeout_secs: DEFAULT_REGISTRY_TIMEOUT_SECS,
            },
            hooks: HookConfig::default(),
            details: DetailsConfig {
                space: DEFAULT_SPACE.to_string(),
                data_set_type: DEFAULT_DATA_SET_TYPE.to_string(),
            },
            processor_properties: BTreeMap::new(),
            on_error_overrides: None,
            notify_recipient: None,
        }
    }

    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Read `DSS_*` variables without touching `.env` or validating
    pub fn from_env() -> anyhow::Result<Self> {
        let root = env_path("DSS_DATA_ROOT").unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let mut config = Self::for_root(root);

        let dirs = &mut config.directories;
        for (var, slot) in [
            ("DSS_INCOMING_DIR", &mut dirs.incoming),
            ("DSS_STAGING_DIR", &mut dirs.staging),
            ("DSS_PRECOMMIT_DIR", &mut dirs.precommit),
            ("DSS_STORE_DIR", &mut dirs.store),
            ("DSS_ERROR_DIR", &mut dirs.error),
            ("DSS_REGISTRATION_LOG_DIR", &mut dirs.registration_log),
        ] {
            if let Some(path) = env_path(var) {
                *slot = path;
            }
        }

        if let Some(flag) = env_flag("DSS_USE_MARKER_FILES")? {
            config.drop_box.use_marker_files = flag;
        }
        if let Some(secs) = env_parse("DSS_QUIET_PERIOD_SECS")? {
            config.drop_box.quiet_period_secs = secs;
        }
        if let Some(secs) = env_parse("DSS_SCAN_INTERVAL_SECS")? {
            config.drop_box.scan_interval_secs = secs;
        }

        if let Ok(handler) = std::env::var("DSS_DELIVERY_HANDLER") {
            config.drop_box.handler = match handler.trim().to_lowercase().as_str() {
                "plain" => HandlerKind::Plain,
                "container" => HandlerKind::Container,
                other => anyhow::bail!("DSS_DELIVERY_HANDLER must be 'plain' or 'container', got '{}'", other),
            };
        }

        if let Ok(mode) = std::env::var("DSS_REGISTRY_MODE") {
            config.registry.mode = match mode.trim().to_lowercase().as_str() {
                "http" => RegistryMode::Http,
                "memory" => RegistryMode::Memory,
                other => anyhow::bail!("DSS_REGISTRY_MODE must be 'http' or 'memory', got '{}'", other),
            };
        }
        if let Ok(url) = std::env::var("DSS_REGISTRY_URL") {
            config.registry.url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(secs) = env_parse("DSS_REGISTRY_TIMEOUT_SECS")? {
            config.registry.timeout_secs = secs;
        }

        config.hooks = HookConfig {
            pre_registration: env_path("DSS_PRE_REGISTRATION_SCRIPT"),
            post_registration: env_path("DSS_POST_REGISTRATION_SCRIPT"),
            pre_delivery: env_path("DSS_PRE_DELIVERY_SCRIPT"),
            post_delivery: env_path("DSS_POST_DELIVERY_SCRIPT"),
        };

        if let Ok(space) = std::env::var("DSS_DEFAULT_SPACE") {
            config.details.space = space.trim().to_uppercase();
        }
        if let Ok(data_set_type) = std::env::var("DSS_DEFAULT_DATA_SET_TYPE") {
            config.details.data_set_type = data_set_type.trim().to_uppercase();
        }

        config.processor_properties = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(PROCESSOR_PROPERTY_PREFIX)
                    .map(|k| (k.to_lowercase(), value))
            })
            .collect();

        config.on_error_overrides = std::env::var("DSS_ON_ERROR_OVERRIDES")
            .ok()
            .filter(|v| !v.trim().is_empty());
        config.notify_recipient = std::env::var("DSS_NOTIFY_RECIPIENT")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let named = self.directories.named();
        for (name, path) in &named {
            if path.as_os_str().is_empty() {
                anyhow::bail!("The {} directory cannot be empty", name);
            }
        }
        for (i, (name, path)) in named.iter().enumerate() {
            if let Some((other, _)) = named[i + 1..].iter().find(|(_, p)| p == path) {
                anyhow::bail!(
                    "The {} and {} directories must differ (both are {})",
                    name,
                    other,
                    path.display()
                );
            }
        }

        if self.drop_box.scan_interval_secs == 0 {
            anyhow::bail!("DSS_SCAN_INTERVAL_SECS must be greater than 0");
        }

        if self.registry.mode == RegistryMode::Http {
            if self.registry.url.is_empty() {
                anyhow::bail!("Registry URL cannot be empty");
            }
            if !self.registry.url.starts_with("http://") && !self.registry.url.starts_with("https://") {
                anyhow::bail!("Registry URL must start with http:// or https://, got '{}'", self.registry.url);
            }
            if self.registry.timeout_secs == 0 {
                anyhow::bail!("DSS_REGISTRY_TIMEOUT_SECS must be greater than 0");
            }
        }

        if self.details.space.is_empty() || self.details.data_set_type.is_empty() {
            anyhow::bail!("Default space and data set type cannot be empty");
        }

        self.rollback_policy()?;

        Ok(())
    }

    /// Undo table with the configured overrides applied
    pub fn rollback_policy(&self) -> anyhow::Result<RollbackPolicy> {
        match &self.on_error_overrides {
            Some(overrides) => Ok(RollbackPolicy::from_overrides(overrides)?),
            None => Ok(RollbackPolicy::default()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistratorConfig::for_root("/data/dss");
        assert!(config.validate().is_ok());
        assert_eq!(config.directories.store, PathBuf::from("/data/dss/store"));
    }

    #[test]
    fn test_duplicate_directories_are_rejected() {
        let mut config = RegistratorConfig::for_root("/data/dss");
        config.directories.error = config.directories.incoming.clone();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("incoming and error"), "{}", err);
    }

    #[test]
    fn test_bad_registry_url_is_rejected() {
        let mut config = RegistratorConfig::for_root("/data/dss");
        config.registry.url = "localhost:8888".to_string();
        assert!(config.validate().is_err());

        config.registry.mode = RegistryMode::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_overrides_fail_validation() {
        let mut config = RegistratorConfig::for_root("/data/dss");
        config.on_error_overrides = Some("interruption@*=delete".to_string());
        assert!(config.validate().is_err());
    }
}
