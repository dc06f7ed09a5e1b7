//! Application configuration for Lorepath.
//!
//! User config lives at `~/.lorepath/lorepath.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LorepathError, Result};
use crate::jobs::QueueName;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "lorepath.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".lorepath";

// ---------------------------------------------------------------------------
// Config structs (matching lorepath.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Worker counts and retry policy.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Folder watcher settings.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// URL monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Metadata extraction settings.
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// AI provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Similarity search defaults.
    #[serde(default)]
    pub search: SearchConfig,

    /// Narrative graph layout and choice settings.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Learner mastery settings.
    #[serde(default)]
    pub mastery: MasteryConfig,

    /// Which enrichment stages run after ingestion.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Configured watched folders.
    #[serde(default)]
    pub folders: Vec<FolderEntry>,

    /// Configured monitored URLs.
    #[serde(default)]
    pub urls: Vec<UrlEntry>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path (`~` expands to the home directory).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.lorepath/lorepath.db".into()
}

/// `[queues]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Maximum attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_concurrency")]
    pub ingestion_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub embedding_concurrency: usize,

    #[serde(default = "default_authoring_concurrency")]
    pub authoring_concurrency: usize,

    #[serde(default = "default_planning_concurrency")]
    pub planning_concurrency: usize,
}

impl QueuesConfig {
    /// Worker count for a queue (at least one).
    pub fn concurrency(&self, queue: QueueName) -> usize {
        let n = match queue {
            QueueName::Ingestion => self.ingestion_concurrency,
            QueueName::Embedding => self.embedding_concurrency,
            QueueName::AiAuthoring => self.authoring_concurrency,
            QueueName::NarrativePlanning => self.planning_concurrency,
        };
        n.max(1)
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            ingestion_concurrency: default_concurrency(),
            embedding_concurrency: default_concurrency(),
            authoring_concurrency: default_authoring_concurrency(),
            planning_concurrency: default_planning_concurrency(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_concurrency() -> usize {
    4
}
fn default_authoring_concurrency() -> usize {
    2
}
fn default_planning_concurrency() -> usize {
    1
}

/// `[watcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// A file is ready once no writes were seen for this long.
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: default_quiescence_ms(),
        }
    }
}

fn default_quiescence_ms() -> u64 {
    2000
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval used by `[[urls]]` entries that do not set one.
    #[serde(default = "default_check_interval")]
    pub default_interval_secs: u64,

    /// HTTP request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Permit loopback and private-network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
            allow_private_hosts: false,
        }
    }
}

fn default_check_interval() -> u64 {
    3600
}
fn default_request_timeout() -> u64 {
    30
}

/// `[processor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Words read per minute when estimating study time.
    #[serde(default = "default_reading_rate")]
    pub reading_rate_wpm: u32,

    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    #[serde(default = "default_max_prerequisites")]
    pub max_prerequisites: usize,

    /// Largest file accepted for ingestion, in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            reading_rate_wpm: default_reading_rate(),
            max_topics: default_max_topics(),
            max_prerequisites: default_max_prerequisites(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_reading_rate() -> u32 {
    200
}
fn default_max_topics() -> usize {
    5
}
fn default_max_prerequisites() -> usize {
    5
}
fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

/// Which provider backend computes embeddings and media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP API.
    Openai,
    /// Deterministic local hashing embedder; no media generation.
    Hashing,
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Fixed vector dimension.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_speech_model")]
    pub speech_model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    /// Directory for generated audio files.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            embedding_model: default_embedding_model(),
            dimensions: default_dimensions(),
            image_model: default_image_model(),
            speech_model: default_speech_model(),
            voice: default_voice(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Hashing
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "LOREPATH_API_KEY".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimensions() -> usize {
    1536
}
fn default_image_model() -> String {
    "gpt-image-1".into()
}
fn default_speech_model() -> String {
    "tts-1".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_artifact_dir() -> String {
    "~/.lorepath/artifacts".into()
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results must score strictly above this cosine similarity.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            limit: default_limit(),
        }
    }
}

fn default_threshold() -> f32 {
    0.7
}
fn default_limit() -> usize {
    20
}

/// `[graph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Layout region width; positions satisfy `0 <= x < width`.
    #[serde(default = "default_width")]
    pub width: f64,

    /// Layout region height; positions satisfy `0 <= y < height`.
    #[serde(default = "default_height")]
    pub height: f64,

    /// Grid cell size.
    #[serde(default = "default_spacing")]
    pub spacing: f64,

    #[serde(default = "default_max_choices")]
    pub max_choices: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            spacing: default_spacing(),
            max_choices: default_max_choices(),
        }
    }
}

fn default_width() -> f64 {
    1000.0
}
fn default_height() -> f64 {
    800.0
}
fn default_spacing() -> f64 {
    120.0
}
fn default_max_choices() -> usize {
    4
}

/// `[mastery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryConfig {
    /// Concepts below this level are knowledge gaps.
    #[serde(default = "default_mastery_threshold")]
    pub threshold: u8,

    /// Weight of new evidence against the running level (`0 < s <= 1`).
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
}

impl Default for MasteryConfig {
    fn default() -> Self {
        Self {
            threshold: default_mastery_threshold(),
            smoothing: default_smoothing(),
        }
    }
}

fn default_mastery_threshold() -> u8 {
    50
}
fn default_smoothing() -> f64 {
    0.4
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Enqueue image generation for every new content unit.
    #[serde(default)]
    pub generate_images: bool,

    /// Enqueue audio narration for every new content unit.
    #[serde(default)]
    pub generate_audio: bool,
}

/// `[[folders]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Stable identifier; generated from the path if omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub organization_id: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_true")]
    pub auto_process: bool,
}

/// `[[urls]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub organization_id: String,
    pub url: String,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.lorepath/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LorepathError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.lorepath/lorepath.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LorepathError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| LorepathError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Check cross-field constraints serde cannot express.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.queues.max_attempts == 0 {
        return Err(LorepathError::config("queues.max_attempts must be at least 1"));
    }
    if !(0.0..=1.0).contains(&config.search.threshold) {
        return Err(LorepathError::config("search.threshold must be within 0.0..=1.0"));
    }
    if config.graph.width <= 0.0 || config.graph.height <= 0.0 || config.graph.spacing <= 0.0 {
        return Err(LorepathError::config(
            "graph width, height and spacing must be positive",
        ));
    }
    if config.mastery.threshold > crate::graph::MAX_MASTERY {
        return Err(LorepathError::config("mastery.threshold must be at most 100"));
    }
    if !(config.mastery.smoothing > 0.0 && config.mastery.smoothing <= 1.0) {
        return Err(LorepathError::config("mastery.smoothing must be in (0, 1]"));
    }
    if config.provider.dimensions == 0 {
        return Err(LorepathError::config("provider.dimensions must be positive"));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LorepathError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LorepathError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LorepathError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the provider API key env var is set when a remote provider is used.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    if config.provider.kind == ProviderKind::Hashing {
        return Ok(());
    }
    let var_name = &config.provider.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(LorepathError::config(format!(
            "provider API key not found. Set the {var_name} environment variable."
        ))),
    }
}
