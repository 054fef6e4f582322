//! Logging configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub default_level: String,
    pub console: ConsoleConfig,
    /// Rolling JSONL file output, if any
    pub file: Option<FileConfig>,
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Human-readable console output at debug level
    pub fn development() -> Self {
        Self {
            default_level: "concord=debug,concord_sync=debug,info".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Default::default()
        }
    }

    /// JSONL files only, rotated daily
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig {
                enabled: false,
                pretty: false,
                ansi: false,
            },
            file: Some(FileConfig {
                directory: log_dir,
                ..FileConfig::default()
            }),
            jsonl: JsonlConfig::default(),
        }
    }

    /// Warnings only, plain console
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: false,
            },
            ..Default::default()
        }
    }
}

/// Console output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human-readable lines instead of JSONL
    pub pretty: bool,
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
        }
    }
}

/// Rolling file output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix; files are named `<prefix>.<date>.jsonl`
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Old files beyond this count are deleted on rotation
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "concord".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(14),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file, truncated at startup
    Never,
}

/// JSONL record shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Put event fields at the top level instead of under `fields`
    pub flatten_events: bool,
    /// Include the full span stack with each event
    pub include_spans: bool,
    pub include_location: bool,
    pub include_thread_info: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_location: false,
            include_thread_info: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let default = LogConfig::default();
        assert_eq!(default.default_level, "info");
        assert!(default.console.enabled);
        assert!(!default.console.pretty);
        assert!(default.file.is_none());

        let dev = LogConfig::development();
        assert!(dev.console.pretty);
        assert!(dev.default_level.contains("concord_sync=debug"));

        let prod = LogConfig::production(PathBuf::from("/var/log/concord"));
        assert!(!prod.console.enabled);
        let file = prod.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/concord"));
        assert_eq!(file.prefix, "concord");

        assert_eq!(LogConfig::testing().default_level, "warn");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: LogConfig = serde_json::from_str(
            r#"{"default_level": "debug", "file": {"directory": "/tmp/c", "rotation": "hourly"}}"#,
        )
        .unwrap();

        assert_eq!(config.default_level, "debug");
        assert!(config.console.enabled);
        let file = config.file.unwrap();
        assert_eq!(file.rotation, RotationStrategy::Hourly);
        assert_eq!(file.prefix, "concord");
        assert!(config.jsonl.flatten_events);
    }
}
