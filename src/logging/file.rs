use super::{LogSink, OutputStream};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB
const LOG_RETENTION_DAYS: i64 = 2;

/// Captures plugin output into `<log_dir>/<plugin>/plugin.log`, rotating by size.
pub struct FileSink {
    log_dir: PathBuf,
    writers: Mutex<HashMap<String, PluginLog>>,
}

struct PluginLog {
    dir: PathBuf,
    file: File,
    size: u64,
}

impl FileSink {
    pub async fn new(base_log_dir: Option<PathBuf>) -> Result<Self> {
        // Use provided directory or default to ~/.plugin-broker/logs
        let log_dir = match base_log_dir {
            Some(dir) => dir,
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "Could not determine home directory",
                    )
                })?;
                home.join(".plugin-broker").join("logs")
            }
        };

        tokio::fs::create_dir_all(&log_dir).await?;

        Ok(Self {
            log_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of the live log file for `plugin`.
    pub fn log_path(&self, plugin: &str) -> PathBuf {
        Self::current_path(&self.log_dir.join(sanitize(plugin)))
    }

    async fn append(&self, plugin: &str, stream: OutputStream, line: &str) -> Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let entry = format!("[{}] [{}] {}\n", timestamp, stream, line);
        let bytes = entry.as_bytes();

        let mut writers = self.writers.lock().await;
        if !writers.contains_key(plugin) {
            let log = PluginLog::open(self.log_dir.join(sanitize(plugin))).await?;
            writers.insert(plugin.to_string(), log);
        }
        let Some(log) = writers.get_mut(plugin) else {
            return Ok(());
        };

        if log.size + bytes.len() as u64 > MAX_LOG_SIZE {
            log.rotate(plugin).await?;
        }

        log.file.write_all(bytes).await?;
        log.file.flush().await?;
        log.size += bytes.len() as u64;

        Ok(())
    }

    fn current_path(dir: &Path) -> PathBuf {
        dir.join("plugin.log")
    }
}

impl PluginLog {
    async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        cleanup_old_logs(&dir).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(FileSink::current_path(&dir))
            .await?;
        let size = file.metadata().await?.len();

        Ok(Self { dir, file, size })
    }

    async fn rotate(&mut self, plugin: &str) -> Result<()> {
        self.file.flush().await?;

        let current = FileSink::current_path(&self.dir);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated = self
            .dir
            .join(format!("{}.{}.log", sanitize(plugin), timestamp));
        if current.exists() {
            tokio::fs::rename(&current, &rotated).await?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current)
            .await?;
        self.size = 0;
        Ok(())
    }
}

async fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let cutoff_time = Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            let modified_time: DateTime<Utc> = modified.into();
            if modified_time < cutoff_time {
                let _ = tokio::fs::remove_file(&path).await;
                tracing::debug!("Deleted old log file: {:?}", path);
            }
        }
    }

    Ok(())
}

/// Plugin names become directory names; keep them to one path segment.
///
/// A leading dot is prefixed so `.` and `..` never name the current or
/// parent directory.
fn sanitize(plugin: &str) -> String {
    let mut name: String = plugin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        name.insert(0, '_');
    }
    name
}

#[async_trait]
impl LogSink for FileSink {
    async fn write_line(&self, plugin: &str, stream: OutputStream, line: &str) {
        if let Err(e) = self.append(plugin, stream, line).await {
            tracing::warn!(plugin, "Failed to write plugin log: {}", e);
        }
    }
}
