#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn::config::CairnConfig;
use cairn::daemon::Daemon;
use cairn::db;
use cairn::embedding::hashed::HashedEmbeddingProvider;
use cairn::embedding::EmbeddingProvider;
use cairn::generation::{Completion, GenerationBackend, Message, ToolSpec};
use cairn::heartbeat::{HeartbeatTask, TaskRunner};
use cairn::workspace::lock::WorkspaceGuard;
use rusqlite::Connection;
use tempfile::TempDir;

/// Open a fresh in-memory database with the schema applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

pub fn hashed_embedder() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashedEmbeddingProvider::new())
}

/// Config rooted in `dir`: hashed embeddings, always-active heartbeat, short lock wait.
pub fn test_config(dir: &Path) -> CairnConfig {
    let mut config = CairnConfig::default();
    config.workspace.root = dir.join("workspace").to_string_lossy().into_owned();
    config.workspace.lock_timeout_secs = 1;
    config.storage.db_path = dir.join("index.db").to_string_lossy().into_owned();
    config.embedding.provider = "hashed".into();
    config.embedding.model = "hashed-384".into();
    config.heartbeat.active_start = "00:00".into();
    config.heartbeat.active_end = "00:00".into();
    config.heartbeat.task_timeout_secs = 5;
    config
}

pub struct TestDaemon {
    pub dir: TempDir,
    pub daemon: Daemon,
    pub backend: Arc<MockBackend>,
}

impl TestDaemon {
    pub fn root(&self) -> &Path {
        self.daemon.workspace().root()
    }

    /// Write a workspace file (creating parent dirs). Returns its absolute path.
    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root().join(rel)).unwrap()
    }

    /// Count rows of a table through the daemon's connection.
    pub fn count(&self, sql: &str) -> i64 {
        let conn = self.daemon.db().lock().unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

/// A daemon over a temp workspace and in-memory index, with a scripted backend.
pub async fn test_daemon(runner: Option<Arc<dyn TaskRunner>>) -> TestDaemon {
    test_daemon_with(runner, |_| {}).await
}

pub async fn test_daemon_with(
    runner: Option<Arc<dyn TaskRunner>>,
    tweak: impl FnOnce(&mut CairnConfig),
) -> TestDaemon {
    test_daemon_parts(runner, hashed_embedder(), tweak).await
}

/// Same as [`test_daemon_with`] but with a caller-supplied embedder.
pub async fn test_daemon_parts(
    runner: Option<Arc<dyn TaskRunner>>,
    embedder: Arc<dyn EmbeddingProvider>,
    tweak: impl FnOnce(&mut CairnConfig),
) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let backend = Arc::new(MockBackend::default());
    let daemon = Daemon::with_parts(
        config,
        test_db(),
        embedder,
        backend.clone(),
        runner,
    )
    .await
    .unwrap();
    TestDaemon {
        dir,
        daemon,
        backend,
    }
}

/// Generation backend that replays queued completions (or failures) and records every
/// request. Falls back to "ok" once the queue is empty.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<Result<Completion, String>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockBackend {
    pub fn push_reply(&self, completion: Completion) {
        self.replies.lock().unwrap().push_back(Ok(completion));
    }

    pub fn push_failure(&self, error: &str) {
        self.replies.lock().unwrap().push_back(Err(error.into()));
    }

    pub fn push_text(&self, text: &str) {
        self.push_reply(Completion {
            text: text.into(),
            tool_calls: vec![],
        });
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> anyhow::Result<Completion> {
        self.requests.lock().unwrap().push(messages.to_vec());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(error)) => anyhow::bail!("{error}"),
            None => Ok(Completion {
                text: "ok".into(),
                tool_calls: vec![],
            }),
        }
    }
}

/// Task runner that records what ran and fails tasks whose description contains `fail_on`.
#[derive(Default)]
pub struct ScriptedRunner {
    pub fail_on: Option<String>,
    pub ran: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.into()),
            ..Default::default()
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, task: &HeartbeatTask, _guard: &WorkspaceGuard) -> anyhow::Result<String> {
        self.ran.lock().unwrap().push(task.id.clone());
        if let Some(needle) = &self.fail_on {
            if task.description.contains(needle.as_str()) {
                anyhow::bail!("task blew up: {}", task.description);
            }
        }
        Ok(format!("did {}", task.description))
    }
}

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const STALLED: u8 = 2;

/// Hashed embedder that can be switched to fail or stall after indexing.
#[derive(Default)]
pub struct SwitchableEmbedder {
    inner: HashedEmbeddingProvider,
    mode: AtomicU8,
}

impl SwitchableEmbedder {
    pub fn recover(&self) {
        self.mode.store(HEALTHY, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.mode.store(FAILING, Ordering::SeqCst);
    }

    /// Sleep well past any test embedding timeout before answering.
    pub fn stall(&self) {
        self.mode.store(STALLED, Ordering::SeqCst);
    }
}

impl EmbeddingProvider for SwitchableEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        match self.mode.load(Ordering::SeqCst) {
            FAILING => anyhow::bail!("embedding model unavailable"),
            STALLED => {
                std::thread::sleep(Duration::from_secs(2));
                self.inner.embed(text)
            }
            _ => self.inner.embed(text),
        }
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
