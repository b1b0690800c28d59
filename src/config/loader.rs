use super::schema::{Config, PortRange, MAX_PORT_ENV, MIN_PORT_ENV};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "PLUGIN_BROKER_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("plugin-broker.toml"))
        .merge(Json::file("plugin-broker.json"))
        .merge(Yaml::file("plugin-broker.yaml"))
        .merge(Yaml::file("plugin-broker.yml"))
        // Override with environment variables (PLUGIN_BROKER_ prefix, __ for nesting)
        .merge(env_overrides())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let base = Figment::new();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => base.merge(Toml::file(path)),
        Some("json") => base.merge(Json::file(path)),
        Some("yaml") | Some("yml") => base.merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into());
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Config file not found: {}",
            path.display()
        ))
        .into());
    }

    let config: Config = figment
        .merge(env_overrides())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

/// `PLUGIN_BROKER_PORTS__MIN_PORT=3000` overrides `ports.minPort`.
fn env_overrides() -> Env {
    Env::prefixed(ENV_PREFIX)
        .lowercase(false)
        .map(|key| env_key_path(key.as_str()).into())
}

fn env_key_path(key: &str) -> String {
    key.split("__")
        .map(camel_case)
        .collect::<Vec<_>>()
        .join(".")
}

fn camel_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, word) in segment.split('_').filter(|w| !w.is_empty()).enumerate() {
        let word = word.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&word);
        } else {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

fn finish(config: Config) -> Result<Config> {
    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    validate_ports(&config.ports)?;

    for (name, plugin) in &config.plugins {
        if plugin.command.trim().is_empty() {
            return Err(
                ConfigError::Validation(format!("Plugin '{}' has empty command", name)).into(),
            );
        }
    }

    if config.startup_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "Startup timeout must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

pub fn validate_ports(ports: &PortRange) -> Result<()> {
    if ports.min_port == 0 {
        return Err(ConfigError::Validation("minPort must be greater than 0".into()).into());
    }
    if ports.min_port > ports.max_port {
        return Err(ConfigError::Validation(format!(
            "minPort ({}) must not exceed maxPort ({})",
            ports.min_port, ports.max_port
        ))
        .into());
    }
    Ok(())
}

/// Reads the port range a host handed to this process at spawn time.
///
/// Missing variables fall back to the default range.
pub fn port_range_from_env() -> Result<PortRange> {
    let defaults = PortRange::default();
    let ports = PortRange {
        min_port: read_port(MIN_PORT_ENV)?.unwrap_or(defaults.min_port),
        max_port: read_port(MAX_PORT_ENV)?.unwrap_or(defaults.max_port),
    };
    validate_ports(&ports)?;
    Ok(ports)
}

fn read_port(var: &str) -> Result<Option<u16>> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|e| ConfigError::EnvVar(format!("{}='{}': {}", var, value, e)).into()),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::EnvVar(format!("{}: {}", var, e)).into()),
    }
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for plugin in config.plugins.values_mut() {
        for arg in &mut plugin.args {
            *arg = substitute_env_vars(arg)?;
        }

        for value in plugin.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginSpec;
    use crate::error::BrokerError;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("BROKER_SUBST_TEST_VALUE", "test_value");

        let result = substitute_env_vars("Hello ${BROKER_SUBST_TEST_VALUE}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${BROKER_SUBST_TEST_MISSING:-default}").unwrap();
        assert_eq!(result, "default");

        assert!(substitute_env_vars("${BROKER_SUBST_TEST_MISSING}").is_err());

        std::env::remove_var("BROKER_SUBST_TEST_VALUE");
    }

    #[test]
    fn test_env_keys_map_to_camel_case_paths() {
        assert_eq!(env_key_path("STARTUP_TIMEOUT_MS"), "startupTimeoutMs");
        assert_eq!(env_key_path("PORTS__MIN_PORT"), "ports.minPort");
        assert_eq!(env_key_path("LOGGING__CAPTURE_TO_FILE"), "logging.captureToFile");
    }

    #[test]
    fn test_load_toml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
startupTimeoutMs = 5000

[ports]
minPort = 30000
maxPort = 30100

[plugins.echo]
command = "/usr/local/bin/echo-plugin"
args = ["--verbose"]
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.ports, PortRange::new(30000, 30100));
        assert_eq!(config.startup_timeout_ms, 5000);
        assert_eq!(config.accept_timeout_ms, Some(60_000));
        assert_eq!(
            config.plugins["echo"],
            PluginSpec::new("/usr/local/bin/echo-plugin").with_args(["--verbose"])
        );
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "plugins:\n  shell:\n    command: /bin/sh\n    args: [\"-c\", \"true\"]\nacceptTimeoutMs: 250\n"
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.plugins["shell"].args, vec!["-c", "true"]);
        assert_eq!(config.accept_timeout_ms, Some(250));
        assert_eq!(config.ports, PortRange::default());
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let config = Config {
            ports: PortRange::new(20000, 10000),
            ..Config::default()
        };
        assert!(matches!(
            validate(&config),
            Err(BrokerError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn test_rejects_empty_command() {
        let mut config = Config::default();
        config.plugins.insert("blank".into(), PluginSpec::new("  "));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            load_from_path("plugin-broker.ini"),
            Err(BrokerError::Config(ConfigError::Parse(_)))
        ));
    }
}
