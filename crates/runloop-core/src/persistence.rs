use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use runloop_types::{Message, RunState};

/// Durable record of run states and thread history. The core calls it at
/// every state transition and after each message it produces.
#[async_trait]
pub trait RunPersistence: Send + Sync {
    async fn save_run_state(&self, state: &RunState) -> anyhow::Result<()>;

    async fn load_run_state(&self, run_id: &str) -> anyhow::Result<Option<RunState>>;

    /// Runs whose last saved status is not terminal.
    async fn list_unfinished_runs(&self) -> anyhow::Result<Vec<RunState>>;

    async fn append_message(&self, message: &Message) -> anyhow::Result<()>;

    async fn load_thread_messages(&self, thread_id: &str) -> anyhow::Result<Vec<Message>>;
}

#[derive(Default)]
pub struct MemoryPersistence {
    runs: RwLock<HashMap<String, RunState>>,
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunPersistence for MemoryPersistence {
    async fn save_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        self.runs
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_run_state(&self, run_id: &str) -> anyhow::Result<Option<RunState>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_unfinished_runs(&self) -> anyhow::Result<Vec<RunState>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|state| !state.is_terminal())
            .cloned()
            .collect())
    }

    async fn append_message(&self, message: &Message) -> anyhow::Result<()> {
        self.threads
            .write()
            .await
            .entry(message.thread_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn load_thread_messages(&self, thread_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// `<state_dir>/runloop` under the platform data directory.
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("runloop"))
        .unwrap_or_else(|| PathBuf::from(".runloop"))
}

/// One JSON file per run under `runs/` and one JSONL file per thread under
/// `threads/`. Run states are cached in memory and written through.
pub struct FilePersistence {
    base: PathBuf,
    runs: RwLock<HashMap<String, RunState>>,
    append_lock: Mutex<()>,
}

impl FilePersistence {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("runs")).await?;
        fs::create_dir_all(base.join("threads")).await?;

        let mut runs = HashMap::new();
        let mut entries = fs::read_dir(base.join("runs")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            match serde_json::from_str::<RunState>(&raw) {
                Ok(state) => {
                    runs.insert(state.run_id.clone(), state);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable run state")
                }
            }
        }

        Ok(Self {
            base,
            runs: RwLock::new(runs),
            append_lock: Mutex::new(()),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base.join("runs").join(format!("{}.json", file_stem(run_id)))
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.base
            .join("threads")
            .join(format!("{}.jsonl", file_stem(thread_id)))
    }
}

fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl RunPersistence for FilePersistence {
    async fn save_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        let path = self.run_path(&state.run_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).await?;
        self.runs
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_run_state(&self, run_id: &str) -> anyhow::Result<Option<RunState>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_unfinished_runs(&self) -> anyhow::Result<Vec<RunState>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|state| !state.is_terminal())
            .cloned()
            .collect())
    }

    async fn append_message(&self, message: &Message) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let _guard = self.append_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.thread_path(&message.thread_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_thread_messages(&self, thread_id: &str) -> anyhow::Result<Vec<Message>> {
        let path = self.thread_path(thread_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut messages = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                // A torn final line from a crash mid-append.
                Err(err) => tracing::warn!(thread_id, error = %err, "skipping unreadable message"),
            }
        }
        Ok(messages)
    }
}
