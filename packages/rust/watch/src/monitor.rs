//! URL monitor: periodic polls that enqueue ingestion when content changes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use lorepath_jobs::JobQueue;
use lorepath_shared::{
    IngestionMetadata, Job, JobPayload, LorepathError, MonitorConfig, MonitoredUrl, Result,
    SourceType, content_hash,
};
use lorepath_storage::Storage;

/// User-Agent string for monitor requests.
const USER_AGENT: &str = concat!("Lorepath/", env!("CARGO_PKG_VERSION"));

/// Result of one check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Same content as last time; only the check time was recorded.
    Unchanged,
    /// New or changed content; an ingestion job was enqueued.
    Changed(Job),
}

/// Registry of scheduled URL checks keyed by monitored-URL id.
#[derive(Clone)]
pub struct UrlMonitor {
    queue: JobQueue,
    storage: Arc<Storage>,
    config: MonitorConfig,
    max_body_bytes: u64,
    client: Client,
    timers: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl UrlMonitor {
    /// Pages larger than `max_body_bytes` fail the check before hashing.
    pub fn new(
        queue: JobQueue,
        storage: Arc<Storage>,
        config: MonitorConfig,
        max_body_bytes: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LorepathError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            queue,
            storage,
            config,
            max_body_bytes,
            client,
            timers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Schedule checks of `monitored` every `check_interval_secs`, starting now.
    ///
    /// Replaces any existing schedule for the same id. A disabled URL is not
    /// scheduled.
    #[instrument(skip_all, fields(url_id = %monitored.id, url = %monitored.url))]
    pub async fn start_monitoring(&self, monitored: &MonitoredUrl) -> Result<()> {
        self.stop_monitoring(&monitored.id).await;
        if !monitored.enabled {
            debug!("url disabled, not monitoring");
            return Ok(());
        }
        self.validate_target(&monitored.url)?;

        let token = CancellationToken::new();
        let period = Duration::from_secs(monitored.check_interval_secs.max(1));
        let monitor = self.clone();
        let url_id = monitored.id.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match monitor.trigger_check(&url_id).await {
                    Ok(_) => {}
                    Err(LorepathError::NotFound { .. }) => {
                        debug!(url_id, "monitored url removed, stopping");
                        break;
                    }
                    Err(e) => warn!(url_id, error = %e, "scheduled check failed"),
                }
            }
        });

        self.timers.lock().await.insert(monitored.id.clone(), token);
        info!(interval_secs = period.as_secs(), "monitoring url");
        Ok(())
    }

    /// Cancel the schedule for `url_id`. Safe when monitoring never started;
    /// returns whether a schedule was cancelled.
    pub async fn stop_monitoring(&self, url_id: &str) -> bool {
        match self.timers.lock().await.remove(url_id) {
            Some(token) => {
                token.cancel();
                info!(url_id, "stopped monitoring url");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        for (_, token) in self.timers.lock().await.drain() {
            token.cancel();
        }
    }

    pub async fn is_monitoring(&self, url_id: &str) -> bool {
        self.timers.lock().await.contains_key(url_id)
    }

    /// Check `url_id` now, outside its schedule.
    pub async fn trigger_check(&self, url_id: &str) -> Result<CheckOutcome> {
        let monitored = self
            .storage
            .get_url(url_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("monitored url", url_id))?;
        self.check(&monitored).await
    }

    /// Fetch, hash and compare against the stored hash.
    ///
    /// Only a first check or a changed hash enqueues ingestion. The new hash
    /// is stored after the job is recorded, so a crash in between re-detects
    /// the change instead of losing it.
    #[instrument(skip_all, fields(url_id = %monitored.id))]
    pub async fn check(&self, monitored: &MonitoredUrl) -> Result<CheckOutcome> {
        self.validate_target(&monitored.url)?;
        let body = self.fetch(&monitored.url).await?;
        let hash = content_hash(&body);
        let now = Utc::now();

        if monitored.last_content_hash.as_deref() == Some(hash.as_str()) {
            self.storage.record_url_check(&monitored.id, None, now).await?;
            debug!("content unchanged");
            return Ok(CheckOutcome::Unchanged);
        }

        let job = self
            .queue
            .enqueue(JobPayload::Ingestion {
                source_type: SourceType::Url,
                source: monitored.url.clone(),
                organization_id: monitored.organization_id.clone(),
                metadata: Some(IngestionMetadata {
                    url_id: Some(monitored.id.clone()),
                    file_size: Some(body.len() as u64),
                    ..IngestionMetadata::default()
                }),
            })
            .await?;
        self.storage
            .record_url_check(&monitored.id, Some(&hash), now)
            .await?;
        info!(job_id = %job.id, first = monitored.last_content_hash.is_none(), "content changed, ingestion enqueued");
        Ok(CheckOutcome::Changed(job))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LorepathError::Network(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LorepathError::Network(format!("{url}: HTTP {status}")));
        }
        read_limited(response, self.max_body_bytes).await
    }

    fn validate_target(&self, raw: &str) -> Result<()> {
        let url = Url::parse(raw)
            .map_err(|e| LorepathError::validation(format!("invalid URL '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LorepathError::validation(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        if !self.config.allow_private_hosts && is_ssrf_target(&url) {
            return Err(LorepathError::validation(format!(
                "refusing to monitor private or loopback host: {raw}"
            )));
        }
        Ok(())
    }
}

/// Buffer a response body, failing as soon as it exceeds `max_bytes`.
///
/// A declared `Content-Length` over the limit is refused without reading.
pub async fn read_limited(mut response: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>> {
    let url = response.url().to_string();
    let too_large = |len: u64| {
        LorepathError::validation(format!(
            "{url} returned {len} bytes, above the {max_bytes} byte limit"
        ))
    };
    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(too_large(len));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| LorepathError::Network(format!("{url}: {e}")))?
    {
        let len = (body.len() + chunk.len()) as u64;
        if len > max_bytes {
            return Err(too_large(len));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Whether `url` points at a loopback, private or otherwise local host.
pub fn is_ssrf_target(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return is_private_ip(&ip);
    }
    host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10
                || (o[0] == 100 && (o[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorepath_jobs::Orchestrator;
    use lorepath_shared::{JobStatus, QueuesConfig};
    use lorepath_storage::JobFilter;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        orch: Orchestrator,
        storage: Arc<Storage>,
        monitor: UrlMonitor,
    }

    async fn fixture(allow_private_hosts: bool) -> Fixture {
        let tmp = std::env::temp_dir().join(format!("lp_monitor_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        let orch = Orchestrator::new(storage.clone(), QueuesConfig::default());
        let monitor = UrlMonitor::new(
            orch.queue(),
            storage.clone(),
            MonitorConfig {
                allow_private_hosts,
                request_timeout_secs: 5,
                ..MonitorConfig::default()
            },
            1024,
        )
        .unwrap();
        Fixture {
            orch,
            storage,
            monitor,
        }
    }

    async fn register(storage: &Storage, url: String, interval: u64) -> MonitoredUrl {
        let monitored = MonitoredUrl {
            id: "u1".into(),
            organization_id: "org".into(),
            url,
            check_interval_secs: interval,
            last_content_hash: None,
            last_checked_at: None,
            enabled: true,
            created_at: Utc::now(),
        };
        storage.upsert_url(&monitored).await.unwrap();
        monitored
    }

    async fn serve(server: &MockServer, body: &str) {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/lesson"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn only_changed_content_enqueues() {
        let server = MockServer::start().await;
        let fx = fixture(true).await;
        register(&fx.storage, format!("{}/lesson", server.uri()), 3600).await;

        serve(&server, "<h1>Cells</h1>").await;
        let first = fx.monitor.trigger_check("u1").await.unwrap();
        let CheckOutcome::Changed(job) = first else {
            panic!("first check must enqueue");
        };
        assert_eq!(job.status, JobStatus::Pending);

        let stored = fx.storage.get_url("u1").await.unwrap().unwrap();
        assert!(stored.last_content_hash.is_some());
        let first_checked = stored.last_checked_at.unwrap();

        let second = fx.monitor.trigger_check("u1").await.unwrap();
        assert!(matches!(second, CheckOutcome::Unchanged));
        let stored_again = fx.storage.get_url("u1").await.unwrap().unwrap();
        assert_eq!(stored_again.last_content_hash, stored.last_content_hash);
        assert!(stored_again.last_checked_at.unwrap() >= first_checked);

        serve(&server, "<h1>Cells, revised</h1>").await;
        assert!(matches!(
            fx.monitor.trigger_check("u1").await.unwrap(),
            CheckOutcome::Changed(_)
        ));

        let jobs = fx.orch.queue().list(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_enqueues_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fx = fixture(true).await;
        register(&fx.storage, format!("{}/lesson", server.uri()), 3600).await;

        let err = fx.monitor.trigger_check("u1").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(fx.orch.queue().list(&JobFilter::default()).await.unwrap().is_empty());
        let stored = fx.storage.get_url("u1").await.unwrap().unwrap();
        assert!(stored.last_checked_at.is_none());
    }

    #[tokio::test]
    async fn oversized_page_is_rejected_before_hashing() {
        let server = MockServer::start().await;
        serve(&server, &"x".repeat(4096)).await;
        let fx = fixture(true).await;
        register(&fx.storage, format!("{}/lesson", server.uri()), 3600).await;

        let err = fx.monitor.trigger_check("u1").await.unwrap_err();
        assert!(matches!(err, LorepathError::Validation { .. }));
        assert!(!err.is_retryable());
        assert!(fx.orch.queue().list(&JobFilter::default()).await.unwrap().is_empty());
        let stored = fx.storage.get_url("u1").await.unwrap().unwrap();
        assert!(stored.last_content_hash.is_none());
        assert!(stored.last_checked_at.is_none());
    }

    #[tokio::test]
    async fn private_hosts_are_refused_by_default() {
        let server = MockServer::start().await;
        let fx = fixture(false).await;
        let monitored = register(&fx.storage, format!("{}/lesson", server.uri()), 3600).await;

        let err = fx.monitor.start_monitoring(&monitored).await.unwrap_err();
        assert!(matches!(err, LorepathError::Validation { .. }));
        assert!(!fx.monitor.is_monitoring("u1").await);
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let fx = fixture(true).await;
        assert!(!fx.monitor.stop_monitoring("never").await);
        assert!(!fx.monitor.stop_monitoring("never").await);

        let err = fx.monitor.trigger_check("missing").await.unwrap_err();
        assert!(matches!(err, LorepathError::NotFound { .. }));
    }

    #[tokio::test]
    async fn scheduled_check_runs_immediately_then_stops() {
        let server = MockServer::start().await;
        serve(&server, "body").await;
        let fx = fixture(true).await;
        let monitored = register(&fx.storage, format!("{}/lesson", server.uri()), 3600).await;

        fx.monitor.start_monitoring(&monitored).await.unwrap();
        assert!(fx.monitor.is_monitoring("u1").await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let jobs = fx.orch.queue().list(&JobFilter::default()).await.unwrap();
            if jobs.len() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "scheduled check never ran");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert!(fx.monitor.stop_monitoring("u1").await);
        assert!(!fx.monitor.is_monitoring("u1").await);
    }

    #[test]
    fn ssrf_detection() {
        let blocked = [
            "http://127.0.0.1/x",
            "http://10.1.2.3/",
            "http://192.168.0.10/",
            "http://100.64.1.1/",
            "http://[::1]/",
            "http://localhost:8080/",
            "http://printer.local/",
        ];
        for raw in blocked {
            assert!(is_ssrf_target(&Url::parse(raw).unwrap()), "{raw}");
        }
        assert!(!is_ssrf_target(&Url::parse("https://example.com/docs").unwrap()));
        assert!(!is_ssrf_target(&Url::parse("http://8.8.8.8/").unwrap()));
    }
}
