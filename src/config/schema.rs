use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the lowest port a plugin's endpoints may bind.
pub const MIN_PORT_ENV: &str = "PLUGIN_MIN_PORT";
/// Environment variable naming the highest port a plugin's endpoints may bind.
pub const MAX_PORT_ENV: &str = "PLUGIN_MAX_PORT";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub plugins: HashMap<String, PluginSpec>,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to launch one plugin subprocess.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

/// Inclusive range of ports that single-connection endpoints may bind.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Directory for per-plugin output capture, defaults to ~/.plugin-broker/logs
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub capture_to_file: bool,
}

// Default value functions
fn default_startup_timeout() -> u64 {
    60_000
}

fn default_accept_timeout() -> Option<u64> {
    Some(60_000)
}

fn default_min_port() -> u16 {
    10_000
}

fn default_max_port() -> u16 {
    25_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins: HashMap::new(),
            ports: PortRange::default(),
            startup_timeout_ms: default_startup_timeout(),
            accept_timeout_ms: default_accept_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
        }
    }
}

impl PluginSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl PortRange {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self { min_port, max_port }
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.min_port..=self.max_port
    }

    /// The environment a plugin subprocess receives to learn its port range.
    pub fn env_pairs(&self) -> [(&'static str, String); 2] {
        [
            (MIN_PORT_ENV, self.min_port.to_string()),
            (MAX_PORT_ENV, self.max_port.to_string()),
        ]
    }
}

impl Config {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }
}
