//! # Concord Logging
//!
//! Tracing subscriber setup for Concord nodes and tools.
//!
//! - **Console**: JSONL by default, or human-readable lines
//! - **Files**: rolling JSONL files via `tracing-appender`
//! - **Peer context**: spans opened under a [`PeerContextGuard`] are tagged
//!   with the local peer they belong to
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ```ignore
//! use concord_logging::{ConcordSubscriberBuilder, LogConfig};
//!
//! let _guard = ConcordSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .try_init()?;
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{PeerContext, PeerContextGuard, in_peer_context};
pub use layers::{BoxedLayer, PeerContextLayer};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to initialize logging: {0}")]
    Init(String),
}

type Base = Layered<EnvFilter, Registry>;

/// Fluent builder for the global subscriber
#[derive(Debug, Clone, Default)]
pub struct ConcordSubscriberBuilder {
    config: LogConfig,
}

impl ConcordSubscriberBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_pretty_console(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self
    }

    pub fn with_file_output(mut self, file: FileConfig) -> Self {
        self.config.file = Some(file);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes file output when dropped; keep it alive
    /// for the life of the program. `None` when no file output is
    /// configured.
    ///
    /// # Errors
    ///
    /// [`LoggingError::Io`] if the log file cannot be created,
    /// [`LoggingError::Init`] if a global subscriber is already set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.config.default_level)
                .map_err(|e| LoggingError::Init(e.to_string()))?,
        };

        let (layers, guard) = self.layers()?;
        Registry::default()
            .with(filter)
            .with(layers)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))?;
        Ok(guard)
    }

    /// Like [`try_init`](Self::try_init), but reports failure on stderr
    /// instead of returning it
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: {}", e);
                None
            }
        }
    }

    fn layers(&self) -> Result<(Vec<BoxedLayer<Base>>, Option<WorkerGuard>), LoggingError> {
        let mut layers: Vec<BoxedLayer<Base>> = vec![Box::new(PeerContextLayer::new())];

        if self.config.console.enabled {
            if self.config.console.pretty {
                layers.push(layers::pretty_layer(self.config.console.ansi));
            } else {
                layers.push(layers::jsonl_layer(std::io::stdout, &self.config.jsonl));
            }
        }

        let mut guard = None;
        if let Some(file) = &self.config.file {
            let (writer, file_guard) = file_writer(file)?;
            layers.push(layers::jsonl_layer(writer, &self.config.jsonl));
            guard = Some(file_guard);
        }

        Ok((layers, guard))
    }
}

fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;

    let rotation = match config.rotation {
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.jsonl", config.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("jsonl");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::Init(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to stdout at `info`
pub fn init_default() -> Option<WorkerGuard> {
    ConcordSubscriberBuilder::new().init()
}

/// Pretty console output at debug level for Concord crates
pub fn init_development() -> Option<WorkerGuard> {
    ConcordSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Warnings only; safe to call from every test
pub fn init_testing() {
    let _ = ConcordSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let builder = ConcordSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false)
            .with_pretty_console(true);
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_layers_follow_config() {
        let (layers, guard) = ConcordSubscriberBuilder::new()
            .with_console(false)
            .layers()
            .unwrap();
        assert_eq!(layers.len(), 1);
        assert!(guard.is_none());

        let (layers, _) = ConcordSubscriberBuilder::new().layers().unwrap();
        assert_eq!(layers.len(), 2);
    }

    #[test]
    fn test_single_file_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig {
            directory: dir.path().join("nested"),
            prefix: "node".to_string(),
            rotation: RotationStrategy::Never,
            max_files: None,
        };

        let (layers, guard) = ConcordSubscriberBuilder::new()
            .with_console(false)
            .with_file_output(config)
            .layers()
            .unwrap();
        assert_eq!(layers.len(), 2);
        assert!(guard.is_some());
        assert!(dir.path().join("nested").join("node.jsonl").exists());
    }

    #[test]
    fn test_init_testing_is_idempotent() {
        init_testing();
        init_testing();
        assert!(
            ConcordSubscriberBuilder::new()
                .with_config(LogConfig::testing())
                .try_init()
                .is_err()
        );
    }
}
