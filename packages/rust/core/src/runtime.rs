//! Runtime assembly: storage, orchestrator, handlers and watchers.
//!
//! A [`Runtime`] is an explicitly constructed handle. Build one per process
//! (or per test), call [`Runtime::start`], and release it with
//! [`Runtime::shutdown`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use lorepath_content::{ContentProcessor, DecoderRegistry};
use lorepath_embedding::{AiProvider, EmbeddingService, build_provider};
use lorepath_jobs::{JobQueue, Orchestrator};
use lorepath_narrative::{ChoiceGenerator, GraphPlanner};
use lorepath_shared::{
    AppConfig, FolderEntry, MonitoredUrl, QueueName, Result, UrlEntry, WatchedFolder,
    content_hash, expand_home, validate_config,
};
use lorepath_storage::Storage;
use lorepath_watch::{FolderWatcher, UrlMonitor};

use crate::pipeline::{Pipeline, settings_from_config};
use crate::progress::ProgressTracker;
use crate::session::SessionDelivery;

pub struct Runtime {
    config: AppConfig,
    storage: Arc<Storage>,
    orchestrator: Orchestrator,
    folders: FolderWatcher,
    monitor: UrlMonitor,
    embeddings: EmbeddingService,
    sessions: SessionDelivery,
    progress: ProgressTracker,
}

impl Runtime {
    /// Open the configured database and provider with the built-in decoders.
    pub async fn open(config: AppConfig) -> Result<Self> {
        validate_config(&config)?;
        let db_path = expand_home(&config.storage.db_path);
        let storage = Arc::new(Storage::open(&db_path).await?);
        let provider = build_provider(&config.provider)?;
        info!(db = %db_path.display(), provider = provider.name(), "runtime opened");
        Self::build(config, storage, provider, DecoderRegistry::with_defaults())
    }

    /// Assemble a runtime from explicit parts.
    pub fn build(
        config: AppConfig,
        storage: Arc<Storage>,
        provider: Arc<dyn AiProvider>,
        decoders: DecoderRegistry,
    ) -> Result<Self> {
        let mut orchestrator = Orchestrator::new(storage.clone(), config.queues.clone());
        let queue = orchestrator.queue();

        let embeddings =
            EmbeddingService::new(provider.clone(), storage.clone(), config.search.clone());
        let planner = GraphPlanner::new(storage.clone(), config.graph.clone());
        let pipeline = Arc::new(Pipeline::new(
            storage.clone(),
            queue.clone(),
            ContentProcessor::with_decoders(config.processor.clone(), decoders),
            embeddings.clone(),
            provider,
            planner,
            settings_from_config(&config),
        )?);
        for name in QueueName::ALL {
            orchestrator.register(name, pipeline.clone());
        }

        let progress = ProgressTracker::new(storage.clone(), config.mastery.clone());
        let sessions = SessionDelivery::new(
            storage.clone(),
            progress.clone(),
            ChoiceGenerator::new(config.graph.clone()),
        );
        let folders = FolderWatcher::new(queue.clone(), config.watcher.clone());
        let monitor = UrlMonitor::new(
            queue,
            storage.clone(),
            config.monitor.clone(),
            config.processor.max_file_bytes,
        )?;

        Ok(Self {
            config,
            storage,
            orchestrator,
            folders,
            monitor,
            embeddings,
            sessions,
            progress,
        })
    }

    /// Recover unfinished jobs, start the workers, then register every
    /// enabled folder and URL. A source that cannot be watched is logged
    /// and skipped.
    pub async fn start(&mut self) -> Result<()> {
        self.sync_configured_sources().await?;
        self.orchestrator.start().await?;

        for folder in self.storage.list_folders().await? {
            if !folder.enabled {
                continue;
            }
            if let Err(e) = self.folders.watch_folder(&folder).await {
                warn!(folder_id = %folder.id, error = %e, "could not watch folder");
            }
        }
        for url in self.storage.list_urls().await? {
            if !url.enabled {
                continue;
            }
            if let Err(e) = self.monitor.start_monitoring(&url).await {
                warn!(url_id = %url.id, error = %e, "could not monitor url");
            }
        }
        info!("runtime started");
        Ok(())
    }

    /// Stop watchers, then drain in-flight jobs.
    pub async fn shutdown(&self) {
        self.folders.stop_all().await;
        self.monitor.stop_all().await;
        self.orchestrator.shutdown().await;
        info!("runtime stopped");
    }

    /// Write the config file's `[[folders]]` and `[[urls]]` into storage.
    async fn sync_configured_sources(&self) -> Result<()> {
        for entry in &self.config.folders {
            let id = entry
                .id
                .clone()
                .unwrap_or_else(|| derived_id("folder", &entry.organization_id, &entry.path));
            let created_at = match self.storage.get_folder(&id).await? {
                Some(existing) => existing.created_at,
                None => Utc::now(),
            };
            self.storage
                .upsert_folder(&folder_from_entry(id, entry, created_at))
                .await?;
        }
        for entry in &self.config.urls {
            let id = entry
                .id
                .clone()
                .unwrap_or_else(|| derived_id("url", &entry.organization_id, &entry.url));
            let interval = entry
                .check_interval_secs
                .unwrap_or(self.config.monitor.default_interval_secs);
            self.storage
                .upsert_url(&url_from_entry(id, entry, interval))
                .await?;
        }
        Ok(())
    }

    pub fn queue(&self) -> JobQueue {
        self.orchestrator.queue()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn embeddings(&self) -> &EmbeddingService {
        &self.embeddings
    }

    pub fn sessions(&self) -> &SessionDelivery {
        &self.sessions
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn folders(&self) -> &FolderWatcher {
        &self.folders
    }

    pub fn monitor(&self) -> &UrlMonitor {
        &self.monitor
    }
}

/// Stable id for a config entry without an explicit one.
fn derived_id(kind: &str, organization_id: &str, locator: &str) -> String {
    let hash = content_hash(format!("{organization_id}\n{locator}").as_bytes());
    format!("{kind}-{}", &hash[..16])
}

fn folder_from_entry(
    id: String,
    entry: &FolderEntry,
    created_at: chrono::DateTime<Utc>,
) -> WatchedFolder {
    WatchedFolder {
        id,
        organization_id: entry.organization_id.clone(),
        path: expand_home(&entry.path).display().to_string(),
        enabled: entry.enabled,
        file_types: entry.file_types.clone(),
        recursive: entry.recursive,
        auto_process: entry.auto_process,
        created_at,
        updated_at: Utc::now(),
    }
}

fn url_from_entry(id: String, entry: &UrlEntry, interval: u64) -> MonitoredUrl {
    MonitoredUrl {
        id,
        organization_id: entry.organization_id.clone(),
        url: entry.url.clone(),
        check_interval_secs: interval,
        last_content_hash: None,
        last_checked_at: None,
        enabled: entry.enabled,
        created_at: Utc::now(),
    }
}
