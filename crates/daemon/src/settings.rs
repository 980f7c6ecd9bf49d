//! Daemon configuration
//!
//! Layered with the `config` crate: an optional file (TOML, JSON or YAML by
//! extension) and then `EVENTJOBS__`-prefixed environment variables, e.g.
//! `EVENTJOBS__ENGINE__INSTANCE_ID=node-1`.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use eventjobs_core::application::EngineConfig;
use eventjobs_infra_system::CommandSpec;
use serde::Deserialize;

pub const DEFAULT_DB_PATH: &str = "~/.eventjobs/jobs.db";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    /// One command consumer per entry
    pub commands: Vec<CommandSpec>,
    pub db_path: Option<String>,
    pub rpc_port: Option<u16>,
}

impl DaemonConfig {
    /// Load from `path` (if any) and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(env_source())
            .build()
            .and_then(Config::try_deserialize::<Self>)
            .with_context(|| format!("invalid configuration (file: {})", path.unwrap_or("none")))
    }

    /// Parse an inline TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .and_then(Config::try_deserialize::<Self>)
            .context("invalid configuration")
    }

    /// Store location with `~` expanded
    pub fn db_path(&self) -> String {
        let raw = self.db_path.as_deref().unwrap_or(DEFAULT_DB_PATH);
        shellexpand::tilde(raw).into_owned()
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("EVENTJOBS")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventjobs_core::domain::QueueType;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.commands.is_empty());
        assert!(config.db_path().ends_with(".eventjobs/jobs.db"));
    }

    #[test]
    fn test_full_document() {
        let config = DaemonConfig::from_toml(
            r#"
            db_path = "/tmp/jobs.db"
            rpc_port = 9600

            [engine]
            instance_id = "node-1"
            repository_path = "/jobs"
            background_load_delay_secs = 0

            [[engine.queues]]
            name = "imports"
            type = "ORDERED"
            topics = ["import/*"]

            [[commands]]
            topics = ["import/*"]
            program = "/usr/local/bin/import"
            args = ["--quiet"]
            timeout_secs = 30
            env_allowlist = ["PATH"]
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path(), "/tmp/jobs.db");
        assert_eq!(config.rpc_port, Some(9600));
        assert_eq!(config.engine.instance_id.as_deref(), Some("node-1"));
        assert_eq!(config.engine.queues[0].queue_type, QueueType::Ordered);
        assert!(config.engine.validate().is_ok());

        let command = &config.commands[0];
        assert_eq!(command.program, "/usr/local/bin/import");
        assert_eq!(command.timeout_secs, Some(30));
        assert_eq!(command.ranking, 0);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(DaemonConfig::load(Some("/nonexistent/eventjobs.toml")).is_err());
    }
}
