use anyhow::{anyhow, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use plugin_broker::client::{ClientRegistry, ClientSettings};
use plugin_broker::config::{self, Config};
use plugin_broker::demo::DemoEnvironment;
use plugin_broker::environment::{Environment, EnvironmentClient};
use plugin_broker::logging::{self, FileSink, LogSink, MultiSink, TracingSink};
use plugin_broker::plugin;

#[derive(Parser, Debug)]
#[command(name = "plugin-broker")]
#[command(about = "Run plugins as subprocesses and call into them over local RPC", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve the built-in demo environment as a plugin
    Serve,
    /// Start a configured plugin and invoke it with the given arguments
    Run {
        /// Plugin name from the configuration
        name: String,
        /// Arguments passed to Environment.Invoke
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.debug);

    match args.command {
        Command::Serve => {
            plugin::serve(Arc::new(DemoEnvironment::new())).await?;
            Ok(())
        }
        Command::Run { name, args: plugin_args } => {
            let config = load_config(args.config)?;
            let code = run_plugin(&config, &name, plugin_args).await?;
            std::process::exit(code);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(&path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file().context("failed to load configuration")?
        }
    };
    info!("Loaded {} plugin configurations", config.plugins.len());
    Ok(config)
}

async fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn LogSink>> {
    let mut sink = MultiSink::new().with(Arc::new(TracingSink));
    if config.logging.capture_to_file {
        let file_sink = FileSink::new(config.logging.log_dir.clone())
            .await
            .context("failed to set up plugin log files")?;
        info!("Capturing plugin output under {}", file_sink.log_dir().display());
        sink = sink.with(Arc::new(file_sink));
    }
    Ok(Arc::new(sink))
}

async fn run_plugin(config: &Config, name: &str, args: Vec<String>) -> anyhow::Result<i32> {
    let spec = config
        .plugins
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("no plugin named '{}' in configuration", name))?;

    let registry = ClientRegistry::new(ClientSettings::from_config(config), build_sink(config).await?);
    let client = registry.new_managed_client(name, spec);

    let outcome = tokio::select! {
        outcome = async {
            let address = client.start().await?;
            let env = EnvironmentClient::connect(&address).await?;
            env.invoke(args).await
        } => outcome.map_err(anyhow::Error::from),
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping plugins");
            Err(anyhow!("interrupted"))
        }
    };

    registry.cleanup().await;

    match outcome {
        Ok(code) => {
            info!(plugin = name, code, "Plugin invocation finished");
            println!("{code}");
            Ok(code)
        }
        Err(e) => {
            error!(plugin = name, "Plugin invocation failed: {}", e);
            Err(e)
        }
    }
}
