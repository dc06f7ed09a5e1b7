//! Folder watcher: debounced file-system events become ingestion jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, Debouncer, new_debouncer};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use lorepath_jobs::JobQueue;
use lorepath_shared::{
    IngestionMetadata, Job, JobPayload, LorepathError, Result, SourceType, WatchedFolder,
    WatcherConfig,
};

/// A live watch: the debouncer owns the OS watch, the task turns its
/// batches into jobs. Dropping the debouncer releases the OS handle.
struct WatchHandle {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    fn close(self) {
        self.task.abort();
    }
}

/// Registry of folder watches keyed by folder id.
#[derive(Clone)]
pub struct FolderWatcher {
    queue: JobQueue,
    config: WatcherConfig,
    handles: Arc<Mutex<HashMap<String, WatchHandle>>>,
}

impl FolderWatcher {
    pub fn new(queue: JobQueue, config: WatcherConfig) -> Self {
        Self {
            queue,
            config,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or restart) watching `folder`.
    ///
    /// A disabled folder is not watched; any existing watch for its id is
    /// released instead.
    #[instrument(skip_all, fields(folder_id = %folder.id, path = %folder.path))]
    pub async fn watch_folder(&self, folder: &WatchedFolder) -> Result<()> {
        self.stop_watching(&folder.id).await;
        if !folder.enabled {
            debug!("folder disabled, not watching");
            return Ok(());
        }

        let root = PathBuf::from(&folder.path);
        if !root.is_dir() {
            return Err(LorepathError::Watch(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let mut debouncer = new_debouncer(
            Duration::from_millis(self.config.quiescence_ms),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    // `AnyContinuous` fires while writes are still arriving;
                    // only `Any` marks a full quiet window.
                    let settled: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| e.kind == DebouncedEventKind::Any)
                        .map(|e| e.path)
                        .collect();
                    if !settled.is_empty() {
                        let _ = tx.send(settled);
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
        )
        .map_err(|e| LorepathError::Watch(format!("failed to create watcher: {e}")))?;

        let mode = if folder.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(&root, mode)
            .map_err(|e| LorepathError::Watch(format!("{}: {e}", root.display())))?;

        let queue = self.queue.clone();
        let watched = folder.clone();
        let task = tokio::spawn(async move {
            while let Some(paths) = rx.recv().await {
                for path in paths {
                    if let Err(e) = on_file_ready(&queue, &watched, &path).await {
                        warn!(path = %path.display(), error = %e, "failed to enqueue ingestion");
                    }
                }
            }
        });

        self.handles.lock().await.insert(
            folder.id.clone(),
            WatchHandle {
                _debouncer: debouncer,
                task,
            },
        );
        info!(recursive = folder.recursive, "watching folder");
        Ok(())
    }

    /// Release the watch for `folder_id`. Unknown ids and repeated calls are
    /// no-ops; returns whether a watch was released.
    pub async fn stop_watching(&self, folder_id: &str) -> bool {
        match self.handles.lock().await.remove(folder_id) {
            Some(handle) => {
                handle.close();
                info!(folder_id, "stopped watching folder");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        for (_, handle) in self.handles.lock().await.drain() {
            handle.close();
        }
    }

    pub async fn is_watching(&self, folder_id: &str) -> bool {
        self.handles.lock().await.contains_key(folder_id)
    }
}

/// Enqueue ingestion for a path that has stopped changing.
///
/// Paths that no longer exist (removals) and paths outside the folder's
/// file types are ignored. Folders without auto-processing record the job
/// without delivering it.
pub(crate) async fn on_file_ready(
    queue: &JobQueue,
    folder: &WatchedFolder,
    path: &Path,
) -> Result<Option<Job>> {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        debug!(path = %path.display(), "path gone, ignoring");
        return Ok(None);
    };
    if !meta.is_file() || !folder.accepts(path) {
        return Ok(None);
    }

    let payload = JobPayload::Ingestion {
        source_type: SourceType::File,
        source: path.display().to_string(),
        organization_id: folder.organization_id.clone(),
        metadata: Some(IngestionMetadata {
            folder_id: Some(folder.id.clone()),
            url_id: None,
            file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            file_size: Some(meta.len()),
        }),
    };

    let job = if folder.auto_process {
        queue.enqueue(payload).await?
    } else {
        queue.enqueue_deferred(payload).await?
    };
    info!(job_id = %job.id, path = %path.display(), deferred = job.deferred, "file ingestion enqueued");
    Ok(Some(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use chrono::Utc;
    use lorepath_jobs::Orchestrator;
    use lorepath_shared::{JobStatus, QueuesConfig};
    use lorepath_storage::{JobFilter, Storage};
    use uuid::Uuid;

    async fn orchestrator() -> Orchestrator {
        let tmp = std::env::temp_dir().join(format!("lp_watch_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        Orchestrator::new(storage, QueuesConfig::default())
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lp_watch_dir_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn folder(path: &Path, auto_process: bool) -> WatchedFolder {
        WatchedFolder {
            id: "f1".into(),
            organization_id: "org".into(),
            path: path.display().to_string(),
            enabled: true,
            file_types: vec!["md".into(), "pdf".into()],
            recursive: true,
            auto_process,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ready_file_becomes_pending_ingestion_job() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let file = dir.join("lesson1.pdf");
        std::fs::write(&file, b"%PDF-1.4").unwrap();

        let job = on_file_ready(&orch.queue(), &folder(&dir, true), &file)
            .await
            .unwrap()
            .expect("job enqueued");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.deferred);
        match &job.payload {
            JobPayload::Ingestion {
                source_type,
                source,
                metadata,
                ..
            } => {
                assert_eq!(*source_type, SourceType::File);
                assert!(source.ends_with("lesson1.pdf"));
                let meta = metadata.as_ref().unwrap();
                assert_eq!(meta.folder_id.as_deref(), Some("f1"));
                assert_eq!(meta.file_size, Some(8));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn removed_and_filtered_paths_enqueue_nothing() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let watched = folder(&dir, true);

        let gone = dir.join("gone.md");
        assert!(on_file_ready(&orch.queue(), &watched, &gone).await.unwrap().is_none());

        let other = dir.join("notes.docx");
        std::fs::write(&other, b"x").unwrap();
        assert!(on_file_ready(&orch.queue(), &watched, &other).await.unwrap().is_none());

        let jobs = orch.queue().list(&JobFilter::default()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn manual_folders_record_deferred_jobs() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let file = dir.join("a.md");
        std::fs::write(&file, b"# A").unwrap();

        let job = on_file_ready(&orch.queue(), &folder(&dir, false), &file)
            .await
            .unwrap()
            .unwrap();
        assert!(job.deferred);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let watcher = FolderWatcher::new(orch.queue(), WatcherConfig { quiescence_ms: 50 });

        assert!(!watcher.stop_watching("never-registered").await);

        watcher.watch_folder(&folder(&dir, true)).await.unwrap();
        assert!(watcher.is_watching("f1").await);
        assert!(watcher.stop_watching("f1").await);
        assert!(!watcher.stop_watching("f1").await);
        assert!(!watcher.is_watching("f1").await);
    }

    #[tokio::test]
    async fn disabled_folder_releases_existing_watch() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let watcher = FolderWatcher::new(orch.queue(), WatcherConfig { quiescence_ms: 50 });

        let mut f = folder(&dir, true);
        watcher.watch_folder(&f).await.unwrap();
        f.enabled = false;
        watcher.watch_folder(&f).await.unwrap();
        assert!(!watcher.is_watching("f1").await);
    }

    #[tokio::test]
    async fn missing_directory_is_a_watch_error() {
        let orch = orchestrator().await;
        let watcher = FolderWatcher::new(orch.queue(), WatcherConfig::default());
        let missing = std::env::temp_dir().join(format!("lp_missing_{}", Uuid::now_v7()));
        let err = watcher.watch_folder(&folder(&missing, true)).await.unwrap_err();
        assert!(matches!(err, LorepathError::Watch(_)));
    }

    #[tokio::test]
    async fn written_file_is_picked_up_after_quiescence() {
        let orch = orchestrator().await;
        let dir = temp_dir();
        let watcher = FolderWatcher::new(orch.queue(), WatcherConfig { quiescence_ms: 100 });
        watcher.watch_folder(&folder(&dir, true)).await.unwrap();

        std::fs::write(dir.join("lesson1.pdf"), b"%PDF-1.4").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let jobs = orch.queue().list(&JobFilter::default()).await.unwrap();
            if !jobs.is_empty() {
                assert_eq!(jobs[0].status, JobStatus::Pending);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no job after write");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        watcher.stop_all().await;
    }

    #[tokio::test]
    async fn file_still_being_written_waits_for_quiet_window() {
        const QUIESCENCE_MS: u64 = 300;
        let orch = orchestrator().await;
        let dir = temp_dir();
        let watcher = FolderWatcher::new(
            orch.queue(),
            WatcherConfig {
                quiescence_ms: QUIESCENCE_MS,
            },
        );
        watcher.watch_folder(&folder(&dir, true)).await.unwrap();

        // Append every third of the window for about three windows.
        let file = dir.join("slow-copy.md");
        for i in 0..9 {
            let mut out = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file)
                .unwrap();
            writeln!(out, "line {i}").unwrap();
            drop(out);
            tokio::time::sleep(Duration::from_millis(QUIESCENCE_MS / 3)).await;

            let jobs = orch.queue().list(&JobFilter::default()).await.unwrap();
            assert!(jobs.is_empty(), "job enqueued while still writing (step {i})");
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let jobs = orch.queue().list(&JobFilter::default()).await.unwrap();
            if !jobs.is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no job after writes stopped");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Give any late duplicate a chance to show up.
        tokio::time::sleep(Duration::from_millis(QUIESCENCE_MS * 3)).await;
        let jobs = orch.queue().list(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        match &jobs[0].payload {
            JobPayload::Ingestion { source, metadata, .. } => {
                assert!(source.ends_with("slow-copy.md"));
                let size = metadata.as_ref().and_then(|m| m.file_size);
                assert_eq!(size, Some(std::fs::metadata(&file).unwrap().len()));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        watcher.stop_all().await;
    }
}
