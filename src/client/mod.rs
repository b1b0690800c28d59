//! Plugin subprocess lifecycle: spawn, handshake, output drain and kill.
//!
//! A plugin announces itself by printing the address of its root endpoint
//! as the first line on stdout. Everything else it writes, on either stream,
//! is forwarded to a [`LogSink`] tagged with the plugin's name.

use crate::config::{Config, PluginSpec, PortRange};
use crate::error::{BrokerError, Result};
use crate::logging::{LogSink, OutputStream};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Longest single line of plugin output held in memory.
const MAX_OUTPUT_LINE: usize = 64 * 1024;

mod registry;

pub use registry::ClientRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Ports the plugin's endpoints may bind, passed via the environment.
    pub ports: PortRange,
    /// How long to wait for the handshake line.
    pub startup_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ports: config.ports,
            startup_timeout: config.startup_timeout(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Starting,
    Running,
    Failed,
    Exited,
    Killed,
}

/// Flags shared with the background tasks. Each only ever goes false → true.
struct Lifecycle {
    exited: watch::Sender<bool>,
    killed: AtomicBool,
    stdout_closed: watch::Sender<bool>,
    done_logging: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            exited: watch::Sender::new(false),
            killed: AtomicBool::new(false),
            stdout_closed: watch::Sender::new(false),
            done_logging: watch::Sender::new(false),
        }
    }
}

/// Handle to one plugin subprocess.
pub struct PluginClient {
    name: String,
    spec: PluginSpec,
    settings: ClientSettings,
    sink: Arc<dyn LogSink>,
    lifecycle: Arc<Lifecycle>,
    address: OnceLock<String>,
    started: AtomicBool,
    spawned: AtomicBool,
    failed: AtomicBool,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
}

impl PluginClient {
    pub fn new(
        name: impl Into<String>,
        spec: PluginSpec,
        settings: ClientSettings,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            settings,
            sink,
            lifecycle: Arc::new(Lifecycle::new()),
            address: OnceLock::new(),
            started: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            kill_switch: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    /// Address read from the handshake, once `start` has succeeded.
    pub fn address(&self) -> Option<&str> {
        self.address.get().map(String::as_str)
    }

    pub fn exited(&self) -> bool {
        *self.lifecycle.exited.borrow()
    }

    pub fn done_logging(&self) -> bool {
        *self.lifecycle.done_logging.borrow()
    }

    pub fn state(&self) -> ClientState {
        if self.failed.load(Ordering::SeqCst) {
            ClientState::Failed
        } else if self.exited() {
            if self.lifecycle.killed.load(Ordering::SeqCst) {
                ClientState::Killed
            } else {
                ClientState::Exited
            }
        } else if self.address.get().is_some() {
            ClientState::Running
        } else if self.started.load(Ordering::SeqCst) {
            ClientState::Starting
        } else {
            ClientState::Created
        }
    }

    /// Launch the subprocess and wait for its handshake line.
    ///
    /// Returns the trimmed address the plugin printed. A client starts at
    /// most once; on failure the subprocess is killed before returning.
    pub async fn start(&self) -> Result<String> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted(self.name.clone()));
        }

        let result = self.launch().await;
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn launch(&self) -> Result<String> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|source| BrokerError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        // Dropping `child` on the error path kills it (kill_on_drop).
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BrokerError::Spawn {
                name: self.name.clone(),
                source: std::io::Error::other("plugin output streams were not captured"),
            });
        };

        info!(plugin = %self.name, pid = ?child.id(), "Plugin process started");

        let (kill_tx, kill_rx) = oneshot::channel();
        *self
            .kill_switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(kill_tx);
        self.spawned.store(true, Ordering::SeqCst);

        let (handshake_tx, handshake_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            self.name.clone(),
            child,
            kill_rx,
            self.lifecycle.clone(),
        ));
        tokio::spawn(drain_stderr(
            self.name.clone(),
            stderr,
            self.sink.clone(),
            self.lifecycle.clone(),
        ));
        tokio::spawn(read_stdout(
            self.name.clone(),
            stdout,
            self.sink.clone(),
            handshake_tx,
            self.lifecycle.clone(),
        ));

        let limit = self.settings.startup_timeout;
        let result = match timeout(limit, self.await_handshake(handshake_rx)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::StartupTimeout {
                name: self.name.clone(),
                timeout: limit,
            }),
        };

        match result {
            Ok(address) => {
                let address = self.address.get_or_init(|| address).clone();
                info!(plugin = %self.name, %address, "Plugin handshake complete");
                Ok(address)
            }
            Err(err) => {
                warn!(plugin = %self.name, "Plugin failed to start: {}", err);
                self.request_kill();
                Err(err)
            }
        }
    }

    async fn await_handshake(&self, mut handshake: oneshot::Receiver<String>) -> Result<String> {
        let mut exited = self.lifecycle.exited.subscribe();

        tokio::select! {
            biased;
            line = &mut handshake => line.map_err(|_| self.premature_exit()),
            _ = exited.wait_for(|exited| *exited) => {
                // A line written just before exit may still be in the pipe.
                handshake.await.map_err(|_| self.premature_exit())
            }
        }
    }

    fn premature_exit(&self) -> BrokerError {
        BrokerError::PrematureExit {
            name: self.name.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .envs(self.settings.ports.env_pairs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.spec.working_directory {
            cmd.current_dir(dir);
        }

        cmd
    }

    /// Force the subprocess to terminate and wait until its output is drained.
    ///
    /// Returns immediately if the process was never spawned. Safe to call
    /// repeatedly and after the process exited on its own.
    pub async fn kill(&self) {
        if !self.spawned.load(Ordering::SeqCst) {
            return;
        }

        self.request_kill();

        let mut done = self.lifecycle.done_logging.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Wait for the subprocess to exit, without killing it.
    pub async fn wait_exited(&self) {
        if !self.spawned.load(Ordering::SeqCst) {
            return;
        }
        let mut exited = self.lifecycle.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    fn request_kill(&self) {
        let switch = self
            .kill_switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(switch) = switch {
            let _ = switch.send(());
        }
    }
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.name)
            .field("command", &self.spec.command)
            .field("state", &self.state())
            .field("address", &self.address())
            .finish()
    }
}

/// Owns the child until it exits, killing it first if asked to.
async fn watch_exit(
    name: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    lifecycle: Arc<Lifecycle>,
) {
    // A dropped switch means the client is gone; kill in that case too.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            lifecycle.killed.store(true, Ordering::SeqCst);
            if let Err(e) = child.start_kill() {
                debug!(plugin = %name, "Kill signal not delivered: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => info!(plugin = %name, %status, "Plugin process exited"),
        Err(e) => warn!(plugin = %name, "Failed to wait for plugin process: {}", e),
    }

    lifecycle.exited.send_replace(true);
}

/// Forwards stderr to the sink, then marks logging done once the process
/// has exited and stdout has closed too.
async fn drain_stderr<R>(name: String, stderr: R, sink: Arc<dyn LogSink>, lifecycle: Arc<Lifecycle>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    while let Some(line) = next_line(&name, &mut reader).await {
        sink.write_line(&name, OutputStream::Stderr, line.trim_end()).await;
    }

    let mut exited = lifecycle.exited.subscribe();
    let _ = exited.wait_for(|exited| *exited).await;
    let mut stdout_closed = lifecycle.stdout_closed.subscribe();
    let _ = stdout_closed.wait_for(|closed| *closed).await;

    lifecycle.done_logging.send_replace(true);
    debug!(plugin = %name, "Plugin output drained");
}

/// Delivers the first complete stdout line as the handshake, then forwards
/// the rest to the sink.
async fn read_stdout<R>(
    name: String,
    stdout: R,
    sink: Arc<dyn LogSink>,
    handshake: oneshot::Sender<String>,
    lifecycle: Arc<Lifecycle>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut handshake = Some(handshake);

    while let Some(line) = next_line(&name, &mut reader).await {
        let complete = line.ends_with('\n');
        match handshake.take() {
            Some(tx) if complete => {
                let _ = tx.send(line.trim().to_string());
            }
            pending => {
                handshake = pending;
                sink.write_line(&name, OutputStream::Stdout, line.trim_end()).await;
            }
        }
    }

    // Dropping an unused handshake sender tells `start` no line is coming.
    drop(handshake);
    lifecycle.stdout_closed.send_replace(true);
}

/// Next line including its terminator; the last line of a stream may lack one.
///
/// Lines longer than [`MAX_OUTPUT_LINE`] are split into several unterminated pieces.
async fn next_line<R>(name: &str, reader: &mut BufReader<R>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok(available) => available,
            Err(e) => {
                warn!(plugin = %name, "Failed to read plugin output: {}", e);
                break;
            }
        };
        if available.is_empty() {
            break;
        }

        let room = MAX_OUTPUT_LINE - buf.len();
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) if end < room => (end + 1, true),
            _ if available.len() >= room => (room, true),
            _ => (available.len(), false),
        };
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        if done {
            break;
        }
    }

    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}
