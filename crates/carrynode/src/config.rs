use anyhow::{Context, Result};
use carrymesh_routing::scorer::{INPUT_FTC, INPUT_TTL};
use carrymesh_routing::{LinearInput, LinearOracle, OracleRegistry, RouterConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub routing: RouterConfig,
    /// Oracles available to `routing.fuzzy_ruleset`
    #[serde(default)]
    pub oracles: Vec<LinearOracle>,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config
            .routing
            .validate()
            .context("Invalid routing configuration")?;

        config.config_file_path = config_path;
        Ok(config)
    }

    /// Create a new default configuration and write it out
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Scored routing stays off until fuzzy_ruleset names this oracle
        let oracle = LinearOracle {
            name: "ftc-ttl".to_string(),
            inputs: vec![
                LinearInput {
                    name: INPUT_FTC.to_string(),
                    weight: -0.6,
                    scale: 10.0,
                },
                LinearInput {
                    name: INPUT_TTL.to_string(),
                    weight: 0.4,
                    scale: 3600.0,
                },
            ],
            bias: 0.6,
            output: "priority".to_string(),
        };

        let config = Config {
            routing: RouterConfig::default(),
            oracles: vec![oracle],
            logging: LoggingConfig::default(),
            config_file_path: config_path.clone(),
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Registry holding every configured oracle
    pub fn oracle_registry(&self) -> OracleRegistry {
        let mut registry = OracleRegistry::new();
        for oracle in &self.oracles {
            registry.register(Arc::new(oracle.clone()));
        }
        registry
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("carrynode")
            .join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrymesh_routing::{ForwardingMode, QueueMode};
    use tempfile::TempDir;

    #[test]
    fn test_default_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("carrynode.yaml");

        let created = Config::create_default(Some(path.clone())).unwrap();
        let loaded = Config::load(Some(path.clone())).unwrap();

        assert_eq!(loaded.routing, created.routing);
        assert_eq!(loaded.oracles, created.oracles);
        assert_eq!(loaded.config_path(), path.as_path());
        assert!(loaded.oracle_registry().load("ftc-ttl").is_ok());
    }

    #[test]
    fn test_default_path_is_per_user() {
        let path = Config::default_config_path();
        assert!(path.ends_with(Path::new("carrynode").join("config.yaml")));
    }

    #[test]
    fn test_missing_file_mentions_init() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(dir.path().join("absent.yaml"))).unwrap_err();
        assert!(err.to_string().contains("--init"));
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("carrynode.yaml");
        fs::write(
            &path,
            "routing:\n  forwarding: spray_and_wait\n  buffer_capacity: 1000\n",
        )
        .unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.routing.forwarding, ForwardingMode::SprayAndWait);
        assert_eq!(config.routing.buffer_capacity, 1000);
        assert_eq!(config.routing.queue_mode, QueueMode::Fifo);
        assert_eq!(config.routing.spray.initial_copies, 6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_inconsistent_routing_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("carrynode.yaml");
        fs::write(&path, "routing:\n  queue_mode: priority_desc\n").unwrap();

        assert!(Config::load(Some(path)).is_err());
    }
}
