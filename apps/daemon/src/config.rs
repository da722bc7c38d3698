use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const THEMES: &[&str] = &["auto", "dark", "light", "high-contrast"];

const CONFIG_DIR_NAME: &str = "folder-mcp";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub theme: String,
    pub log_level: String,
    /// Active embedding model id; empty means "recommend at startup".
    pub model: String,
    pub daemon: DaemonConfig,
    pub resources: ResourcesConfig,
    #[serde(rename = "folders")]
    pub folders: Vec<FolderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonConfig {
    pub port: u16,
    pub pid_file: Option<PathBuf>,
    pub health_check: bool,
    pub performance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResourcesConfig {
    pub max_concurrent_operations: usize,
    pub max_queue_size: usize,
    pub max_memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FolderEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: "auto".to_string(),
            log_level: "info".to_string(),
            model: String::new(),
            daemon: DaemonConfig::default(),
            resources: ResourcesConfig::default(),
            folders: Vec::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 9876,
            pid_file: None,
            health_check: true,
            performance: true,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 2,
            max_queue_size: 256,
            max_memory_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("no configuration directory available on this platform"))?;
        Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }

        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, raw)
            .with_context(|| format!("Failed to write config at {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !THEMES.contains(&self.theme.as_str()) {
            return Err(anyhow!(
                "unknown theme '{}'; valid themes: {}",
                self.theme,
                THEMES.join(", ")
            ));
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(anyhow!(
                "unknown log level '{}'; valid levels: debug, info, warn, error",
                self.log_level
            ));
        }
        if self.daemon.port == 0 {
            return Err(anyhow!("daemon.port must be non-zero"));
        }
        if self.resources.max_concurrent_operations == 0 {
            return Err(anyhow!("resources.max-concurrent-operations must be at least 1"));
        }
        if self.resources.max_queue_size == 0 {
            return Err(anyhow!("resources.max-queue-size must be at least 1"));
        }

        for folder in &self.folders {
            if folder.path.as_os_str().is_empty() {
                return Err(anyhow!("folder entries must carry a path"));
            }
        }

        Ok(())
    }

    /// Dotted-key read used by `config get`.
    pub fn get_key(&self, key: &str) -> Result<String> {
        match key {
            "theme" => Ok(self.theme.clone()),
            "log-level" => Ok(self.log_level.clone()),
            "model" => Ok(self.model.clone()),
            "daemon.port" => Ok(self.daemon.port.to_string()),
            "daemon.health-check" => Ok(self.daemon.health_check.to_string()),
            "daemon.performance" => Ok(self.daemon.performance.to_string()),
            "resources.max-concurrent-operations" => {
                Ok(self.resources.max_concurrent_operations.to_string())
            }
            "resources.max-queue-size" => Ok(self.resources.max_queue_size.to_string()),
            "resources.max-memory-bytes" => Ok(self.resources.max_memory_bytes.to_string()),
            other => Err(anyhow!("unknown config key '{other}'")),
        }
    }

    /// Dotted-key write used by `config set`. Values are validated before the
    /// config is considered changed.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "theme" => self.theme = value.to_string(),
            "log-level" => self.log_level = value.to_string(),
            "model" => self.model = value.to_string(),
            "daemon.port" => {
                self.daemon.port = value
                    .parse()
                    .map_err(|_| anyhow!("daemon.port must be a port number"))?
            }
            "daemon.health-check" => {
                self.daemon.health_check = value
                    .parse()
                    .map_err(|_| anyhow!("daemon.health-check must be true or false"))?
            }
            "daemon.performance" => {
                self.daemon.performance = value
                    .parse()
                    .map_err(|_| anyhow!("daemon.performance must be true or false"))?
            }
            "resources.max-concurrent-operations" => {
                self.resources.max_concurrent_operations = value
                    .parse()
                    .map_err(|_| anyhow!("resources.max-concurrent-operations must be a count"))?
            }
            "resources.max-queue-size" => {
                self.resources.max_queue_size = value
                    .parse()
                    .map_err(|_| anyhow!("resources.max-queue-size must be a count"))?
            }
            "resources.max-memory-bytes" => {
                self.resources.max_memory_bytes = value
                    .parse()
                    .map_err(|_| anyhow!("resources.max-memory-bytes must be a byte count"))?
            }
            other => return Err(anyhow!("unknown config key '{other}'")),
        }

        self.validate()
    }

    /// Add or update a folder registration.
    pub fn upsert_folder(&mut self, path: PathBuf, model: Option<String>) {
        if let Some(existing) = self.folders.iter_mut().find(|entry| entry.path == path) {
            if model.is_some() {
                existing.model = model;
            }
            return;
        }

        self.folders.push(FolderEntry {
            path,
            model,
            priority: None,
        });
    }
}

pub fn default_cache_dir() -> Result<PathBuf> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("no cache directory available on this platform"))?;
    Ok(dir.join(CONFIG_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::Config;

    fn temp_config_path() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("folder-mcp-config-{nanos}.toml"))
    }

    #[test]
    fn defaults_validate_and_roundtrip() {
        let path = temp_config_path();
        let config = Config::default();
        config.validate().expect("defaults should validate");

        config.save_to(&path).expect("save should succeed");
        let loaded = Config::load_from(&path).expect("load should succeed");
        assert_eq!(loaded, config);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn set_key_rejects_invalid_values() {
        let mut config = Config::default();

        assert!(config.set_key("theme", "dark").is_ok());
        assert!(config.set_key("theme", "sparkly").is_err());
        assert!(config.set_key("log-level", "verbose").is_err());
        assert!(config.set_key("daemon.port", "not-a-port").is_err());
        assert!(config
            .set_key("resources.max-concurrent-operations", "0")
            .is_err());
        assert!(config.set_key("no.such.key", "1").is_err());

        // The failed writes must not have corrupted the config.
        assert_eq!(config.theme, "dark");
        config.validate().expect("config should still validate");
    }

    #[test]
    fn get_key_reads_back_values() {
        let mut config = Config::default();
        config
            .set_key("resources.max-concurrent-operations", "4")
            .expect("set should succeed");

        assert_eq!(
            config
                .get_key("resources.max-concurrent-operations")
                .expect("get should succeed"),
            "4"
        );
        assert!(config.get_key("bogus").is_err());
    }

    #[test]
    fn upsert_folder_deduplicates_by_path() {
        let mut config = Config::default();
        config.upsert_folder(PathBuf::from("/docs"), None);
        config.upsert_folder(PathBuf::from("/docs"), Some("cpu:gte-small".to_string()));

        assert_eq!(config.folders.len(), 1);
        assert_eq!(config.folders[0].model.as_deref(), Some("cpu:gte-small"));
    }
}
