//! Runtime settings: a JSON config file merged with command-line flags.
//!
//! Every field may come from either source; a flag given on the command line
//! wins over the file, and the file wins over the built-in default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chainmux_engine::WellKnownChains;
use clap::ValueEnum;
use serde::Deserialize;

/// Which engine runs the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Forward every chain to a JSON-RPC node (`--upstream`).
    Upstream,
    /// In-process loopback that only answers health checks.
    Memory,
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub max_connections: Option<usize>,
    pub engine: Option<EngineKind>,
    /// Chain spec `id` → node WebSocket URL.
    pub upstreams: BTreeMap<String, String>,
    /// Well-known chain name → chain spec file.
    pub chain_specs: BTreeMap<String, PathBuf>,
    pub health_interval_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub teardown_grace_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        // Spec paths are relative to the config file
        if let Some(dir) = path.parent() {
            for spec in config.chain_specs.values_mut() {
                if spec.is_relative() {
                    *spec = dir.join(&*spec);
                }
            }
        }
        Ok(config)
    }
}

/// The flags that can override the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub max_connections: Option<usize>,
    pub engine: Option<EngineKind>,
    pub upstreams: Vec<(String, String)>,
    pub chain_specs: Vec<(String, String)>,
    pub health_interval_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub teardown_grace_ms: Option<u64>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub port: u16,
    pub hostname: String,
    pub max_connections: usize,
    pub engine: EngineKind,
    pub upstreams: BTreeMap<String, String>,
    pub chain_specs: BTreeMap<String, PathBuf>,
    pub health_interval: Duration,
    pub handshake_timeout: Duration,
    pub teardown_grace: Duration,
}

impl Settings {
    pub fn resolve(file: FileConfig, flags: Overrides) -> Self {
        let mut upstreams = file.upstreams;
        upstreams.extend(flags.upstreams);
        let mut chain_specs = file.chain_specs;
        chain_specs.extend(
            flags
                .chain_specs
                .into_iter()
                .map(|(name, path)| (name, PathBuf::from(path))),
        );

        // Without any upstream there is nothing to forward to
        let engine = flags.engine.or(file.engine).unwrap_or(if upstreams.is_empty() {
            EngineKind::Memory
        } else {
            EngineKind::Upstream
        });

        Self {
            port: flags.port.or(file.port).unwrap_or(9944),
            hostname: flags
                .hostname
                .or(file.hostname)
                .unwrap_or_else(|| "127.0.0.1".into()),
            max_connections: flags.max_connections.or(file.max_connections).unwrap_or(64),
            engine,
            upstreams,
            chain_specs,
            health_interval: millis(flags.health_interval_ms.or(file.health_interval_ms), 10_000),
            handshake_timeout: millis(flags.handshake_timeout_ms.or(file.handshake_timeout_ms), 10_000),
            teardown_grace: millis(flags.teardown_grace_ms.or(file.teardown_grace_ms), 0),
        }
    }

    /// Load every configured chain spec.
    pub fn well_known_chains(&self) -> anyhow::Result<WellKnownChains> {
        let mut chains = WellKnownChains::new();
        for (name, path) in &self.chain_specs {
            chains
                .load_file(name, path)
                .with_context(|| format!("failed to load chain spec {name} from {}", path.display()))?;
        }
        Ok(chains)
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

/// Parse a `KEY=VALUE` flag.
pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file_or_flags() {
        let settings = Settings::resolve(FileConfig::default(), Overrides::default());
        assert_eq!(settings.port, 9944);
        assert_eq!(settings.hostname, "127.0.0.1");
        assert_eq!(settings.engine, EngineKind::Memory);
        assert_eq!(settings.health_interval, Duration::from_secs(10));
        assert!(settings.teardown_grace.is_zero());
    }

    #[test]
    fn flags_win_over_file() {
        let file = FileConfig {
            port: Some(1000),
            hostname: Some("0.0.0.0".into()),
            upstreams: BTreeMap::from([("westend2".into(), "ws://file".into())]),
            health_interval_ms: Some(500),
            ..FileConfig::default()
        };
        let flags = Overrides {
            port: Some(2000),
            upstreams: vec![("westend2".into(), "ws://flag".into())],
            ..Overrides::default()
        };

        let settings = Settings::resolve(file, flags);
        assert_eq!(settings.port, 2000);
        assert_eq!(settings.hostname, "0.0.0.0");
        assert_eq!(settings.upstreams["westend2"], "ws://flag");
        assert_eq!(settings.health_interval, Duration::from_millis(500));
        assert_eq!(settings.engine, EngineKind::Upstream);
    }

    #[test]
    fn parses_pairs() {
        assert_eq!(
            parse_pair("westend=specs/westend.json"),
            Ok(("westend".into(), "specs/westend.json".into()))
        );
        assert!(parse_pair("westend").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn loads_file_with_relative_specs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("westend.json"), r#"{"name":"Westend","id":"westend2"}"#).unwrap();
        let path = dir.path().join("chainmux.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"port": 9000, "engine": "memory", "chainSpecs": {{"westend": "westend.json"}}}}"#
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.chain_specs["westend"], dir.path().join("westend.json"));

        let settings = Settings::resolve(config, Overrides::default());
        let chains = settings.well_known_chains().unwrap();
        assert!(chains.contains("westend"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"prot": 9000}}"#).unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }
}
