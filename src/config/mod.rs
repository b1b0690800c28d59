mod loader;
mod schema;

pub use loader::{load_from_env_or_file, load_from_path, port_range_from_env, validate};
pub use schema::{Config, LoggingConfig, PluginSpec, PortRange, MAX_PORT_ENV, MIN_PORT_ENV};
