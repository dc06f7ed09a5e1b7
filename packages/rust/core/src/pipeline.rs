//! Job handlers wiring ingestion, enrichment and graph planning together.
//!
//! Every handler is safe to re-run: content units are inserted if absent,
//! artifacts are skipped once present, and node creation is idempotent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use lorepath_content::ContentProcessor;
use lorepath_embedding::{AiProvider, EmbeddingService};
use lorepath_jobs::{JobContext, JobHandler, JobQueue};
use lorepath_narrative::GraphPlanner;
use lorepath_shared::{
    Job, JobPayload, LorepathError, Nugget, NuggetStatus, Result, SourceType, expand_home,
};
use lorepath_storage::Storage;
use lorepath_watch::{is_ssrf_target, read_limited};

/// User-Agent string for ingestion fetches.
const USER_AGENT: &str = concat!("Lorepath/", env!("CARGO_PKG_VERSION"));

/// Longest text sent for narration.
const MAX_NARRATION_CHARS: usize = 4096;

/// Pipeline knobs taken from the app config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_bytes: u64,
    pub generate_images: bool,
    pub generate_audio: bool,
    pub artifact_dir: PathBuf,
    pub allow_private_hosts: bool,
    pub request_timeout: Duration,
}

/// Handles the jobs of all four queues.
pub struct Pipeline {
    storage: Arc<Storage>,
    queue: JobQueue,
    processor: ContentProcessor,
    embeddings: EmbeddingService,
    provider: Arc<dyn AiProvider>,
    planner: GraphPlanner,
    settings: PipelineSettings,
    client: Client,
}

impl Pipeline {
    pub fn new(
        storage: Arc<Storage>,
        queue: JobQueue,
        processor: ContentProcessor,
        embeddings: EmbeddingService,
        provider: Arc<dyn AiProvider>,
        planner: GraphPlanner,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| LorepathError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            storage,
            queue,
            processor,
            embeddings,
            provider,
            planner,
            settings,
            client,
        })
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Read or fetch the source, turn it into a content unit and queue its
    /// enrichment.
    #[instrument(skip_all, fields(org_id = %organization_id, source = %source))]
    async fn ingest(
        &self,
        source_type: SourceType,
        source: &str,
        organization_id: &str,
    ) -> Result<Nugget> {
        let (bytes, content_type) = match source_type {
            SourceType::File => (self.read_file(Path::new(source)).await?, None),
            SourceType::Url => self.fetch(source).await?,
        };

        let known_topics = self.storage.list_known_topics(organization_id).await?;
        let processed =
            self.processor
                .process(&bytes, source, content_type.as_deref(), &known_topics)?;
        if processed.text.trim().is_empty() {
            return Err(LorepathError::validation(format!(
                "{source} contains no readable text"
            )));
        }

        let candidate = Nugget::new(
            organization_id,
            processed.title,
            source,
            processed.text,
            Some(processed.metadata),
        );
        let (nugget, created) = self.storage.insert_nugget_if_absent(&candidate).await?;
        if !created {
            debug!(nugget_id = %nugget.id, "content unit already exists");
        }

        // A re-run after a crash still queues enrichment the first run missed
        if nugget.status == NuggetStatus::Pending {
            self.queue
                .enqueue(JobPayload::Embedding {
                    nugget_id: nugget.id.clone(),
                    content: nugget.content.clone(),
                    organization_id: organization_id.to_string(),
                })
                .await?;
        }
        if self.settings.generate_images && nugget.image_url.is_none() {
            self.queue
                .enqueue(JobPayload::ImageGeneration {
                    nugget_id: nugget.id.clone(),
                    organization_id: organization_id.to_string(),
                })
                .await?;
        }
        if self.settings.generate_audio && nugget.audio_url.is_none() {
            self.queue
                .enqueue(JobPayload::AudioGeneration {
                    nugget_id: nugget.id.clone(),
                    organization_id: organization_id.to_string(),
                })
                .await?;
        }

        info!(nugget_id = %nugget.id, created, title = %nugget.title, "content unit ingested");
        Ok(nugget)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LorepathError::not_found("file", path.display().to_string()));
            }
            Err(e) => return Err(LorepathError::io(path, e)),
        };
        if meta.len() > self.settings.max_file_bytes {
            return Err(LorepathError::validation(format!(
                "{} is {} bytes, above the {} byte limit",
                path.display(),
                meta.len(),
                self.settings.max_file_bytes
            )));
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| LorepathError::io(path, e))
    }

    async fn fetch(&self, source: &str) -> Result<(Vec<u8>, Option<String>)> {
        let url = Url::parse(source)
            .map_err(|e| LorepathError::validation(format!("invalid URL '{source}': {e}")))?;
        if !self.settings.allow_private_hosts && is_ssrf_target(&url) {
            return Err(LorepathError::validation(format!(
                "refusing to fetch private or loopback host: {source}"
            )));
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| LorepathError::Network(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LorepathError::Network(format!("{url}: HTTP {status}")));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = read_limited(response, self.settings.max_file_bytes).await?;
        Ok((bytes, content_type))
    }

    // -----------------------------------------------------------------------
    // Enrichment
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(nugget_id = %nugget_id, attempt = ctx.attempt))]
    async fn embed(
        &self,
        nugget_id: &str,
        content: &str,
        organization_id: &str,
        ctx: &JobContext,
    ) -> Result<()> {
        let nugget = self.load_nugget(nugget_id).await?;
        if nugget.status == NuggetStatus::Ready && nugget.embedding.is_some() {
            debug!("already embedded");
        } else {
            self.storage
                .update_nugget_status(nugget_id, NuggetStatus::Processing)
                .await?;
            if let Err(e) = self.embeddings.embed_nugget(nugget_id, content).await {
                if !e.is_retryable() || ctx.is_final_attempt() {
                    warn!(error = %e, "embedding failed for good, marking content unit failed");
                    self.storage
                        .update_nugget_status(nugget_id, NuggetStatus::Failed)
                        .await?;
                }
                return Err(e);
            }
        }

        self.queue
            .enqueue(JobPayload::NarrativePlanning {
                organization_id: organization_id.to_string(),
                nugget_ids: vec![nugget_id.to_string()],
            })
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(nugget_id = %nugget_id))]
    async fn author_image(&self, nugget_id: &str) -> Result<()> {
        let nugget = self.load_nugget(nugget_id).await?;
        if nugget.image_url.is_some() {
            debug!("image already generated");
            return Ok(());
        }
        let url = self.provider.generate_image(&image_prompt(&nugget)).await?;
        self.storage.set_nugget_image(nugget_id, &url).await?;
        info!(%url, "image generated");
        Ok(())
    }

    #[instrument(skip_all, fields(nugget_id = %nugget_id))]
    async fn author_audio(&self, nugget_id: &str) -> Result<()> {
        let nugget = self.load_nugget(nugget_id).await?;
        if nugget.audio_url.is_some() {
            debug!("audio already generated");
            return Ok(());
        }
        let text: String = nugget.content.chars().take(MAX_NARRATION_CHARS).collect();
        let audio = self.provider.generate_audio(&text).await?;

        let dir = &self.settings.artifact_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| LorepathError::io(dir, e))?;
        let path = dir.join(format!("{nugget_id}.mp3"));
        tokio::fs::write(&path, &audio)
            .await
            .map_err(|e| LorepathError::io(&path, e))?;

        let reference = path.display().to_string();
        self.storage.set_nugget_audio(nugget_id, &reference).await?;
        info!(path = %reference, bytes = audio.len(), "audio generated");
        Ok(())
    }

    async fn load_nugget(&self, nugget_id: &str) -> Result<Nugget> {
        self.storage
            .get_nugget(nugget_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("nugget", nugget_id))
    }
}

fn image_prompt(nugget: &Nugget) -> String {
    let topics = nugget
        .metadata
        .as_ref()
        .map(|m| m.topics.join(", "))
        .filter(|t| !t.is_empty());
    match topics {
        Some(topics) => format!(
            "An illustration for a lesson titled \"{}\" about {topics}",
            nugget.title
        ),
        None => format!("An illustration for a lesson titled \"{}\"", nugget.title),
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<()> {
        match &job.payload {
            JobPayload::Ingestion {
                source_type,
                source,
                organization_id,
                ..
            } => self
                .ingest(*source_type, source, organization_id)
                .await
                .map(|_| ()),
            JobPayload::Embedding {
                nugget_id,
                content,
                organization_id,
            } => self.embed(nugget_id, content, organization_id, ctx).await,
            JobPayload::ImageGeneration { nugget_id, .. } => self.author_image(nugget_id).await,
            JobPayload::AudioGeneration { nugget_id, .. } => self.author_audio(nugget_id).await,
            JobPayload::NarrativePlanning {
                organization_id,
                nugget_ids,
            } => self
                .planner
                .plan(organization_id, nugget_ids)
                .await
                .map(|_| ()),
        }
    }
}

/// Settings with the artifact directory's `~` expanded.
pub fn settings_from_config(config: &lorepath_shared::AppConfig) -> PipelineSettings {
    PipelineSettings {
        max_file_bytes: config.processor.max_file_bytes,
        generate_images: config.pipeline.generate_images,
        generate_audio: config.pipeline.generate_audio,
        artifact_dir: expand_home(&config.provider.artifact_dir),
        allow_private_hosts: config.monitor.allow_private_hosts,
        request_timeout: Duration::from_secs(config.monitor.request_timeout_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePdf, FakeProvider, test_config, test_storage};
    use lorepath_content::DecoderRegistry;
    use lorepath_jobs::Orchestrator;
    use lorepath_shared::{AppConfig, QueueName};
    use lorepath_storage::JobFilter;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        storage: Arc<Storage>,
        orch: Orchestrator,
        provider: Arc<FakeProvider>,
        pipeline: Pipeline,
    }

    async fn fixture(config: AppConfig) -> Fixture {
        let storage = test_storage().await;
        let orch = Orchestrator::new(storage.clone(), config.queues.clone());
        let provider = Arc::new(FakeProvider::default());
        let mut decoders = DecoderRegistry::with_defaults();
        decoders.register(Arc::new(FakePdf));
        let pipeline = Pipeline::new(
            storage.clone(),
            orch.queue(),
            ContentProcessor::with_decoders(config.processor.clone(), decoders),
            EmbeddingService::new(provider.clone(), storage.clone(), config.search.clone()),
            provider.clone(),
            GraphPlanner::new(storage.clone(), config.graph.clone()),
            settings_from_config(&config),
        )
        .unwrap();
        Fixture {
            storage,
            orch,
            provider,
            pipeline,
        }
    }

    fn first_attempt() -> JobContext {
        JobContext {
            attempt: 1,
            max_attempts: 3,
        }
    }

    fn file_job(path: &Path) -> Job {
        Job::new(
            JobPayload::Ingestion {
                source_type: SourceType::File,
                source: path.display().to_string(),
                organization_id: "org".into(),
                metadata: None,
            },
            3,
        )
    }

    fn scratch_file(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lp_pipeline_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    async fn jobs_in(orch: &Orchestrator, queue: QueueName) -> Vec<Job> {
        orch.queue()
            .list(&JobFilter {
                queue: Some(queue),
                ..JobFilter::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ingestion_creates_unit_once_and_queues_embedding() {
        let fx = fixture(test_config()).await;
        let file = scratch_file("lesson1.pdf", b"%PDF");
        let job = file_job(&file);

        fx.pipeline.handle(&job, &first_attempt()).await.unwrap();
        let nuggets = fx.storage.list_nuggets("org").await.unwrap();
        assert_eq!(nuggets.len(), 1);
        assert_eq!(nuggets[0].status, NuggetStatus::Pending);
        assert_eq!(nuggets[0].title, "Lesson One");
        let meta = nuggets[0].metadata.as_ref().unwrap();
        assert!(meta.topics.iter().any(|t| t.contains("Cell")));

        // Redelivery: no second unit
        fx.pipeline.handle(&job, &first_attempt()).await.unwrap();
        assert_eq!(fx.storage.list_nuggets("org").await.unwrap().len(), 1);

        let embedding = jobs_in(&fx.orch, QueueName::Embedding).await;
        assert!(!embedding.is_empty());
        assert!(jobs_in(&fx.orch, QueueName::AiAuthoring).await.is_empty());
    }

    #[tokio::test]
    async fn ingestion_rejects_missing_oversized_and_unknown_files() {
        let mut config = test_config();
        config.processor.max_file_bytes = 4;
        let fx = fixture(config).await;

        let missing = std::env::temp_dir().join(format!("lp_missing_{}.md", Uuid::now_v7()));
        let err = fx.pipeline.handle(&file_job(&missing), &first_attempt()).await.unwrap_err();
        assert!(matches!(err, LorepathError::NotFound { .. }));

        let big = scratch_file("big.md", b"# far too long");
        let err = fx.pipeline.handle(&file_job(&big), &first_attempt()).await.unwrap_err();
        assert!(matches!(err, LorepathError::Validation { .. }));

        let odd = scratch_file("a.xyz", b"abc");
        let err = fx.pipeline.handle(&file_job(&odd), &first_attempt()).await.unwrap_err();
        assert!(matches!(err, LorepathError::Decode(_)));
        assert!(!err.is_retryable());

        assert!(fx.storage.list_nuggets("org").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn url_ingestion_uses_the_response_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lessons/cells"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(
                        "<html><head><title>Cells</title></head>\
                         <body><main><p>Every Living Thing is made of cells.</p></main></body></html>",
                    ),
            )
            .mount(&server)
            .await;

        let fx = fixture(test_config()).await;
        let job = Job::new(
            JobPayload::Ingestion {
                source_type: SourceType::Url,
                source: format!("{}/lessons/cells", server.uri()),
                organization_id: "org".into(),
                metadata: None,
            },
            3,
        );
        fx.pipeline.handle(&job, &first_attempt()).await.unwrap();

        let nuggets = fx.storage.list_nuggets("org").await.unwrap();
        assert_eq!(nuggets[0].title, "Cells");
        assert!(nuggets[0].content.contains("made of cells"));
    }

    #[tokio::test]
    async fn embedding_marks_ready_and_queues_planning() {
        let fx = fixture(test_config()).await;
        let unit = Nugget::new("org", "t", "/a", "cells and membranes", None);
        fx.storage.insert_nugget_if_absent(&unit).await.unwrap();

        let job = Job::new(
            JobPayload::Embedding {
                nugget_id: unit.id.clone(),
                content: unit.content.clone(),
                organization_id: "org".into(),
            },
            3,
        );
        fx.pipeline.handle(&job, &first_attempt()).await.unwrap();

        let stored = fx.storage.get_nugget(&unit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NuggetStatus::Ready);
        assert_eq!(stored.embedding.as_ref().map(Vec::len), Some(64));

        let planning = jobs_in(&fx.orch, QueueName::NarrativePlanning).await;
        assert_eq!(planning.len(), 1);
    }

    #[tokio::test]
    async fn empty_embedding_fails_the_unit() {
        let fx = fixture(test_config()).await;
        let unit = Nugget::new("org", "t", "/a", "...", None);
        fx.storage.insert_nugget_if_absent(&unit).await.unwrap();

        let job = Job::new(
            JobPayload::Embedding {
                nugget_id: unit.id.clone(),
                content: "... !!".into(),
                organization_id: "org".into(),
            },
            3,
        );
        let err = fx.pipeline.handle(&job, &first_attempt()).await.unwrap_err();
        assert!(matches!(err, LorepathError::EmptyEmbedding(_)));

        let stored = fx.storage.get_nugget(&unit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NuggetStatus::Failed);
        assert!(jobs_in(&fx.orch, QueueName::NarrativePlanning).await.is_empty());
    }

    #[tokio::test]
    async fn authoring_runs_once_per_artifact() {
        let mut config = test_config();
        config.pipeline.generate_images = true;
        config.pipeline.generate_audio = true;
        let fx = fixture(config.clone()).await;

        let file = scratch_file("lesson1.pdf", b"%PDF");
        fx.pipeline.handle(&file_job(&file), &first_attempt()).await.unwrap();
        let authoring = jobs_in(&fx.orch, QueueName::AiAuthoring).await;
        assert_eq!(authoring.len(), 2);

        for job in &authoring {
            fx.pipeline.handle(job, &first_attempt()).await.unwrap();
            fx.pipeline.handle(job, &first_attempt()).await.unwrap();
        }
        assert_eq!(fx.provider.image_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.provider.audio_calls.load(Ordering::SeqCst), 1);

        let unit = &fx.storage.list_nuggets("org").await.unwrap()[0];
        assert!(unit.image_url.as_deref().unwrap().starts_with("https://cdn.example.com/"));
        let audio = PathBuf::from(unit.audio_url.as_deref().unwrap());
        assert!(audio.starts_with(&config.provider.artifact_dir));
        assert_eq!(std::fs::read(audio).unwrap(), vec![0x49, 0x44, 0x33]);
    }

    #[test]
    fn image_prompt_mentions_topics_when_known() {
        let mut unit = Nugget::new("org", "Cells", "/a", "x", None);
        assert_eq!(image_prompt(&unit), "An illustration for a lesson titled \"Cells\"");
        unit.metadata = Some(lorepath_shared::NuggetMetadata {
            topics: vec!["Cell Membrane".into()],
            ..lorepath_shared::NuggetMetadata::fallback()
        });
        assert!(image_prompt(&unit).ends_with("about Cell Membrane"));
    }
}
