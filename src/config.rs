//! Configuration store for dbdeck.
//!
//! The frontend's preferences live in a single JSON document under the user's
//! home directory. Reads never fail hard: a missing or corrupt file yields the
//! default configuration so the shell can always start.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable that relocates the application directory.
pub const HOME_ENV: &str = "DBDECK_HOME";

const APP_DIR_NAME: &str = ".dbdeck";
const CONFIG_FILE: &str = "config.json";
const BACKUP_FILE: &str = "config.backup.json";
const CONFIG_VERSION: u32 = 1;

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Schema version of the document.
    pub config_version: u32,
    /// Settings used to launch the local database.
    pub serving: ServingSettings,
    /// Window preferences.
    pub window: WindowSettings,
    /// Keys owned by the frontend; preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            serving: ServingSettings::default(),
            window: WindowSettings::default(),
            extra: Map::new(),
        }
    }
}

/// Settings for serving the local database.
///
/// Driver and log level stay strings here so an unknown value written by a
/// frontend does not invalidate the whole document; they are validated when
/// the database is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServingSettings {
    /// Storage driver (`memory`, `file`, `surrealkv`, `tikv`).
    pub driver: String,
    /// Log level passed to the database.
    pub log_level: String,
    /// Storage path or cluster address for persistent drivers.
    pub storage: String,
    /// Path to the database executable; empty means bundled or `PATH`.
    pub executable: String,
    /// Initial root user.
    pub username: String,
    /// Initial root password.
    pub password: String,
    /// Port to bind.
    pub port: u32,
    /// Host interface to bind.
    pub host: String,
    /// Number of console lines kept in memory.
    pub history_size: usize,
    /// Start the database with legacy authentication.
    pub legacy_compat: bool,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            log_level: "info".to_string(),
            storage: String::new(),
            executable: String::new(),
            username: "root".to_string(),
            password: "root".to_string(),
            port: 8000,
            host: "0.0.0.0".to_string(),
            history_size: 250,
            legacy_compat: false,
        }
    }
}

/// Per-launch replacements for persisted serving settings.
///
/// Filled from command-line flags or from a bridge `start_database` request;
/// `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServingOverrides {
    pub driver: Option<String>,
    pub log_level: Option<String>,
    pub storage: Option<String>,
    pub executable: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u32>,
    pub host: Option<String>,
    pub legacy_compat: Option<bool>,
}

impl ServingOverrides {
    pub fn apply(&self, settings: &mut ServingSettings) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        set(&mut settings.driver, &self.driver);
        set(&mut settings.log_level, &self.log_level);
        set(&mut settings.storage, &self.storage);
        set(&mut settings.executable, &self.executable);
        set(&mut settings.username, &self.username);
        set(&mut settings.password, &self.password);
        set(&mut settings.port, &self.port);
        set(&mut settings.host, &self.host);
        set(&mut settings.legacy_compat, &self.legacy_compat);
    }
}

/// Window preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowSettings {
    /// Whether the window stays above others.
    pub pinned: bool,
}

/// Reads and writes the configuration document at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<app dir>/config.json`.
    pub fn at_default_location() -> Result<Self> {
        Ok(Self::new(app_dir()?.join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.path.with_file_name(BACKUP_FILE)
    }

    /// Loads the configuration, falling back to the default on any failure.
    pub fn load(&self) -> Config {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no config file, using defaults");
            return Config::default();
        }
        match self.try_load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("falling back to default config: {err:#}");
                Config::default()
            }
        }
    }

    /// Loads the configuration, surfacing read and parse errors.
    pub fn try_load(&self) -> Result<Config> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", self.path.display()))?;
        Ok(config)
    }

    /// The effective configuration as JSON text.
    pub fn load_raw(&self) -> Result<String> {
        serde_json::to_string(&self.load()).context("failed to serialize config")
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        self.write_atomic(&text)
    }

    /// Persists JSON text supplied by a frontend. Only objects are accepted.
    pub fn save_raw(&self, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw).context("config is not valid JSON")?;
        if !value.is_object() {
            bail!("config must be a JSON object");
        }
        serde_json::from_value::<Config>(value.clone()).context("config has invalid settings")?;
        self.write_value(&value)
    }

    /// Persists the window's always-on-top flag, keeping everything else.
    ///
    /// Only `window.pinned` is patched in the stored document, so keys this
    /// version does not understand survive. An unreadable file is an error.
    pub fn set_pinned(&self, pinned: bool) -> Result<()> {
        let mut document = self.read_document()?;
        let window = document
            .entry("window")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(window) = window.as_object_mut() else {
            bail!("config key `window` is not an object");
        };
        window.insert("pinned".to_string(), Value::Bool(pinned));
        self.write_value(&Value::Object(document))
    }

    /// Flips the always-on-top flag and returns the new value.
    pub fn toggle_pinned(&self) -> Result<bool> {
        let pinned = !self
            .read_document()?
            .get("window")
            .and_then(|window| window.get("pinned"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.set_pinned(pinned)?;
        Ok(pinned)
    }

    // The stored document as a JSON object; defaults when there is no file.
    fn read_document(&self) -> Result<Map<String, Value>> {
        let value = if self.path.exists() {
            let raw = fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read config file {}", self.path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", self.path.display()))?
        } else {
            serde_json::to_value(Config::default()).context("failed to serialize config")?
        };
        match value {
            Value::Object(document) => Ok(document),
            _ => bail!("config file {} is not a JSON object", self.path.display()),
        }
    }

    fn write_value(&self, value: &Value) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("failed to serialize config")?;
        self.write_atomic(&text)
    }

    /// Copies the current config file next to it as a backup.
    pub fn backup(&self) -> Result<()> {
        if !self.path.is_file() {
            return Err(anyhow!("no config file at {} to back up", self.path.display()));
        }
        let backup = self.backup_path();
        fs::copy(&self.path, &backup)
            .with_context(|| format!("failed to write backup {}", backup.display()))?;
        tracing::info!(path = %backup.display(), "config backed up");
        Ok(())
    }

    pub fn has_backup(&self) -> bool {
        self.backup_path().is_file()
    }

    /// Replaces the config with its backup and returns the restored document.
    pub fn restore_backup(&self) -> Result<Config> {
        let backup = self.backup_path();
        let raw = fs::read_to_string(&backup)
            .with_context(|| format!("failed to read backup {}", backup.display()))?;
        self.save_raw(&raw)?;
        tracing::info!(path = %backup.display(), "config restored from backup");
        self.try_load()
    }

    fn write_atomic(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Directory holding config, logs and exports.
pub fn app_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(APP_DIR_NAME))
        .ok_or_else(|| anyhow!("cannot resolve home directory (set {HOME_ENV})"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(app_dir()?.join("logs"))
}

pub fn exports_dir() -> Result<PathBuf> {
    Ok(app_dir()?.join("exports"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("nested").join(CONFIG_FILE))
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let config = store.load();
        assert_eq!(config, Config::default());
        assert_eq!(config.serving.port, 8000);
        assert_eq!(config.serving.driver, "memory");
        assert_eq!(config.serving.username, "root");
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.try_load().is_err());
        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut config = Config::default();
        config.serving.port = 9100;
        config.serving.driver = "surrealkv".into();
        config.window.pinned = true;
        store.save(&config).unwrap();
        assert_eq!(store.load(), config);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn partial_document_fills_defaults_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .save_raw(r#"{"serving":{"port":9000,"logLevel":"debug"},"theme":"dark"}"#)
            .unwrap();
        let config = store.load();
        assert_eq!(config.serving.port, 9000);
        assert_eq!(config.serving.log_level, "debug");
        assert_eq!(config.serving.password, "root");
        assert_eq!(config.extra.get("theme"), Some(&Value::from("dark")));

        let raw = store.load_raw().unwrap();
        assert!(raw.contains("\"theme\":\"dark\""));
        assert!(raw.contains("\"historySize\":250"));
    }

    #[test]
    fn save_raw_rejects_non_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.save_raw("[1, 2]").is_err());
        assert!(store.save_raw("not json").is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn save_raw_rejects_mistyped_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut config = Config::default();
        config.serving.port = 7100;
        store.save(&config).unwrap();

        let err = store
            .save_raw(r#"{"serving":{"port":"9000","driver":"file","storage":"/data"}}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid settings"));
        assert_eq!(store.load().serving.port, 7100);
    }

    #[test]
    fn pinning_keeps_a_document_it_cannot_parse() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"{"serving":{"port":"9000"},"connections":[{"name":"prod"}]}"#,
        )
        .unwrap();

        assert!(store.toggle_pinned().unwrap());
        let document: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(document["connections"][0]["name"], "prod");
        assert_eq!(document["serving"]["port"], "9000");
        assert_eq!(document["window"]["pinned"], true);
    }

    #[test]
    fn pinning_refuses_to_overwrite_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        assert!(store.set_pinned(true).is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn toggle_pinned_persists_and_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_raw(r#"{"theme":"light"}"#).unwrap();
        assert!(store.toggle_pinned().unwrap());
        assert!(store.load().window.pinned);
        assert!(!store.toggle_pinned().unwrap());
        assert_eq!(store.load().extra.get("theme"), Some(&Value::from("light")));
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let overrides: ServingOverrides =
            serde_json::from_str(r#"{"port":9001,"legacyCompat":true,"logLevel":"trace"}"#)
                .unwrap();
        let mut settings = ServingSettings::default();
        overrides.apply(&mut settings);
        assert_eq!(settings.port, 9001);
        assert!(settings.legacy_compat);
        assert_eq!(settings.log_level, "trace");
        assert_eq!(settings.driver, "memory");
        assert_eq!(settings.username, "root");
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.backup().is_err());
        assert!(!store.has_backup());

        let mut config = Config::default();
        config.serving.port = 7001;
        store.save(&config).unwrap();
        store.backup().unwrap();
        assert!(store.has_backup());

        config.serving.port = 7002;
        store.save(&config).unwrap();
        let restored = store.restore_backup().unwrap();
        assert_eq!(restored.serving.port, 7001);
        assert_eq!(store.load().serving.port, 7001);
    }
}
