//! The process-scoped context: every component, built once at startup and shared.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chat::ChatService;
use crate::config::CairnConfig;
use crate::db::{self, Db};
use crate::embedding::{self, EmbeddingProvider};
use crate::facts::FactStore;
use crate::generation::{self, GenerationBackend};
use crate::heartbeat::runner::AgentTaskRunner;
use crate::heartbeat::{Heartbeat, TaskRunner};
use crate::index::{self, IndexStats, Indexer};
use crate::retrieval::{Retriever, SearchOptions};
use crate::session::SessionManager;
use crate::workspace::lock::Actor;
use crate::workspace::Workspace;

pub struct Daemon {
    config: Arc<CairnConfig>,
    db: Db,
    workspace: Workspace,
    indexer: Indexer,
    retriever: Retriever,
    facts: FactStore,
    heartbeat: Arc<Heartbeat>,
    sessions: Arc<SessionManager>,
    chat: ChatService,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Open the database, create the embedder and generation backend from config, and
    /// bring the workspace and index up to date.
    pub async fn open(config: CairnConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        info!(db = %db_path.display(), "database ready");

        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        info!(model = embedder.model_id(), "embedding provider ready");
        let backend = generation::create_backend(&config.generation)?;

        let daemon = Self::with_parts(config, conn, embedder, backend, None).await?;
        match daemon.reindex(false).await {
            Ok(stats) => info!(
                files = stats.files_indexed,
                chunks = stats.chunks_added,
                "startup reindex complete"
            ),
            Err(e) => warn!(error = %e, "startup reindex failed; serving the existing index"),
        }
        Ok(daemon)
    }

    /// Assemble from already-built parts. `runner` replaces the default agent task runner.
    pub async fn with_parts(
        config: CairnConfig,
        conn: rusqlite::Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn GenerationBackend>,
        runner: Option<Arc<dyn TaskRunner>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let db: Db = Arc::new(Mutex::new(conn));
        let workspace = Workspace::from_config(&config);

        {
            let guard = workspace.acquire(Actor::Indexer, "startup").await?;
            if workspace.init(&guard)? {
                info!(root = %workspace.root().display(), "initialized new workspace");
            }
        }
        {
            let conn = db::lock(&db)?;
            index::check_embedding_model(&conn, embedder.model_id())?;
        }

        let indexer = Indexer::new(
            db.clone(),
            Arc::clone(&embedder),
            workspace.clone(),
            config.index.max_chunk_tokens,
        );
        let retriever = Retriever::new(
            db.clone(),
            Arc::clone(&embedder),
            workspace.root().to_path_buf(),
            SearchOptions::from(&config.retrieval),
            config.embedding.timeout(),
        );
        let facts = FactStore::new(workspace.clone(), indexer.clone());
        let sessions = Arc::new(SessionManager::new(
            workspace.clone(),
            Arc::clone(&backend),
            config.session.clone(),
        ));
        let runner: Arc<dyn TaskRunner> = match runner {
            Some(runner) => runner,
            None => Arc::new(AgentTaskRunner::new(
                workspace.clone(),
                retriever.clone(),
                facts.clone(),
                Arc::clone(&backend),
            )),
        };
        let heartbeat = Arc::new(Heartbeat::new(
            workspace.clone(),
            indexer.clone(),
            db.clone(),
            config.heartbeat.clone(),
            runner,
        ));
        let chat = ChatService::new(
            retriever.clone(),
            Arc::clone(&sessions),
            facts.clone(),
            backend,
            config.generation.max_tool_rounds,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            db,
            workspace,
            indexer,
            retriever,
            facts,
            heartbeat,
            sessions,
            chat,
            shutdown_tx,
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    /// Reindex under the workspace lock. `full` runs a shadow-then-swap rebuild.
    pub async fn reindex(&self, full: bool) -> Result<IndexStats> {
        let guard = self.workspace.acquire(Actor::Indexer, "reindex").await?;
        let stats = if full {
            self.indexer.rebuild().await
        } else {
            self.indexer.reindex_all().await
        };
        drop(guard);
        stats
    }

    /// Start the heartbeat timer if it is enabled and not already running.
    pub fn start_heartbeat(&self) {
        if !self.config.heartbeat.enabled {
            info!("heartbeat disabled in config");
            return;
        }
        let mut task = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.is_none() {
            *task = Some(Arc::clone(&self.heartbeat).spawn(self.shutdown_tx.subscribe()));
        }
    }

    /// Stop the heartbeat and wait for an in-flight cycle to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
        info!("daemon shut down");
    }
}
