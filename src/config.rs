use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub quicktodo: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const QUICKTODO_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            quicktodo: Self::QUICKTODO_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        // trim and lowercase, then fall back to the default if the level is unknown
        let str_original = self.quicktodo.clone();
        self.quicktodo = self.quicktodo.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.quicktodo.as_str()) {
            eprintln!(
                "Config error: quicktodo log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::QUICKTODO_LEVEL
            );
            self.quicktodo = Self::QUICKTODO_LEVEL.to_owned();
        }
    }
}

/// Effects applied to every notification the presenter renders.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationConfig {
    pub sound_enabled: bool,
    pub vibrate_enabled: bool,
    /// Lead time for the optional early reminder. 0 disables it.
    pub remind_before_minutes: u32,
}

impl NotificationConfig {
    // One week
    const MAX_REMIND_BEFORE_MINUTES: u32 = 7 * 24 * 60;

    pub fn remind_before_millis(&self) -> i64 {
        i64::from(self.remind_before_minutes) * 60_000
    }

    fn ensure_valid(&mut self) {
        if self.remind_before_minutes > Self::MAX_REMIND_BEFORE_MINUTES {
            eprintln!(
                "Config error: remind_before_minutes of {} exceeds the maximum - using {}",
                self.remind_before_minutes,
                Self::MAX_REMIND_BEFORE_MINUTES
            );
            self.remind_before_minutes = Self::MAX_REMIND_BEFORE_MINUTES;
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            sound_enabled: false,
            vibrate_enabled: false,
            remind_before_minutes: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    poll_interval_secs: u64,
}

impl SchedulerConfig {
    const POLL_INTERVAL_SECS: u64 = 5;
    const MAX_POLL_INTERVAL_SECS: u64 = 3600;

    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
    }

    fn default() -> Self {
        SchedulerConfig {
            poll_interval_secs: Self::POLL_INTERVAL_SECS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.poll_interval_secs == 0 || self.poll_interval_secs > Self::MAX_POLL_INTERVAL_SECS {
            eprintln!(
                "Config error: poll_interval_secs of {} is invalid - using default of {}",
                self.poll_interval_secs,
                Self::POLL_INTERVAL_SECS
            );
            self.poll_interval_secs = Self::POLL_INTERVAL_SECS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Directory holding the database file. Defaults to the local data dir.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub notifications: NotificationConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    const ENV_PREFIX: &str = "QUICKTODO_";

    pub fn default_config() -> Self {
        Config {
            logging: LoggingConfig::default(),
            notifications: NotificationConfig::default(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data directory.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Self {
        let default_config = Self::default_config();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        // Defaults, then the TOML file, then QUICKTODO_SECTION__KEY environment overrides
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// The process-wide configuration, or defaults if none was loaded.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Self::default_config)
    }

    pub fn database_dir(&self, project_dirs: &ProjectDirs) -> PathBuf {
        match &self.database.dir {
            Some(dir) => PathBuf::from(dir),
            None => project_dirs.data_local_dir().to_path_buf(),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.notifications.ensure_valid();
        self.scheduler.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_missing_file_writes_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("config.toml");
            let config = Config::load_from(&path);

            assert!(path.exists());
            assert_eq!(config.logging.quicktodo, "info");
            assert_eq!(config.notifications, NotificationConfig::default());
            assert_eq!(config.scheduler.poll_interval_secs(), 5);
            assert!(config.database.dir.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_file_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                quicktodo = "DEBUG "

                [notifications]
                sound_enabled = true
                vibrate_enabled = false
                remind_before_minutes = 15
                "#,
            )?;
            let config = Config::load_from(&jail.directory().join("config.toml"));

            assert_eq!(config.logging.quicktodo, "debug");
            assert!(config.notifications.sound_enabled);
            assert!(!config.notifications.vibrate_enabled);
            assert_eq!(config.notifications.remind_before_millis(), 15 * 60_000);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [scheduler]
                poll_interval_secs = 30
                "#,
            )?;
            jail.set_env("QUICKTODO_SCHEDULER__POLL_INTERVAL_SECS", "9");
            jail.set_env("QUICKTODO_NOTIFICATIONS__VIBRATE_ENABLED", "true");
            let config = Config::load_from(&jail.directory().join("config.toml"));

            assert_eq!(config.scheduler.poll_interval_secs(), 9);
            assert!(config.notifications.vibrate_enabled);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                quicktodo = "loud"

                [scheduler]
                poll_interval_secs = 0

                [notifications]
                sound_enabled = false
                vibrate_enabled = false
                remind_before_minutes = 999999
                "#,
            )?;
            let config = Config::load_from(&jail.directory().join("config.toml"));

            assert_eq!(config.logging.quicktodo, "info");
            assert_eq!(config.scheduler.poll_interval_secs(), 5);
            assert_eq!(config.notifications.remind_before_minutes, 7 * 24 * 60);
            Ok(())
        });
    }

    #[test]
    fn test_unparseable_file_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[scheduler]\npoll_interval_secs = \"soon\"\n")?;
            let config = Config::load_from(&jail.directory().join("config.toml"));
            assert_eq!(config.scheduler.poll_interval_secs(), 5);
            Ok(())
        });
    }
}
