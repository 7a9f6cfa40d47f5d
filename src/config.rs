//! Runtime settings for the attractor server.
//!
//! Layered: built-in defaults, then an optional `attractor.toml`, then
//! `ATTRACTOR_*` environment variables. CLI flags are applied last by the
//! binary.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "attractor.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for per-project stores.
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Program run for resolution sessions.
    pub amplifier_cmd: String,
    /// Emit logs as JSON lines instead of the compact format.
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            host: "127.0.0.1".to_string(),
            port: 8000,
            amplifier_cmd: "amplifier".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Parse settings from TOML. Missing keys keep their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse attractor.toml")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Defaults, then `path` (or `./attractor.toml` when it exists), then the
    /// process environment.
    ///
    /// An explicitly given `path` must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply `ATTRACTOR_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ATTRACTOR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("ATTRACTOR_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("ATTRACTOR_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid ATTRACTOR_PORT: '{}'", port))?;
        }
        if let Some(cmd) = lookup("ATTRACTOR_AMPLIFIER_CMD") {
            self.amplifier_cmd = cmd;
        }
        if let Some(flag) = lookup("ATTRACTOR_LOG_JSON") {
            self.log_json = parse_bool(&flag)
                .ok_or_else(|| anyhow!("Invalid ATTRACTOR_LOG_JSON: '{}'", flag))?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backing store of project `name`: `<data_dir>/stores/<name>`.
    pub fn store_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("stores").join(name)
    }

    /// Working directory for sessions of project `name`:
    /// `<data_dir>/projects/<name>`.
    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("projects").join(name)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
