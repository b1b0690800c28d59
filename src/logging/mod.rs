//! Host-side logging: subscriber setup and the sinks plugin output drains into.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

mod file;

pub use file::FileSink;

/// Tracing target for lines forwarded from plugin subprocesses.
pub const PLUGIN_TARGET: &str = "plugin_broker::plugin";

/// Install the global fmt subscriber.
///
/// Output always goes to stderr: a plugin process reserves stdout for the
/// handshake line, and the host drains the plugin's stderr into its own log.
pub fn init(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("plugin_broker={log_level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("STDOUT"),
            OutputStream::Stderr => f.write_str("STDERR"),
        }
    }
}

/// Destination for output lines captured from plugin subprocesses.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn write_line(&self, plugin: &str, stream: OutputStream, line: &str);
}

/// Forwards plugin output into the host's tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn write_line(&self, plugin: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stderr => tracing::info!(target: PLUGIN_TARGET, plugin, "{}", line),
            OutputStream::Stdout => tracing::debug!(target: PLUGIN_TARGET, plugin, "{}", line),
        }
    }
}

/// Writes every line to each inner sink in order.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl LogSink for MultiSink {
    async fn write_line(&self, plugin: &str, stream: OutputStream, line: &str) {
        for sink in &self.sinks {
            sink.write_line(plugin, stream, line).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every captured line in memory.
    #[derive(Default)]
    pub struct MemorySink {
        lines: Mutex<Vec<(String, OutputStream, String)>>,
    }

    impl MemorySink {
        pub fn lines(&self, stream: OutputStream) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, s, _)| *s == stream)
                .map(|(_, _, line)| line.clone())
                .collect()
        }
    }

    #[async_trait]
    impl LogSink for MemorySink {
        async fn write_line(&self, plugin: &str, stream: OutputStream, line: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((plugin.to_string(), stream, line.to_string()));
        }
    }
}
