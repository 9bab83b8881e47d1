use std::{fmt, sync::Arc, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    events::EventLogger, specs_adapter::HttpSpecsAdapter, DataStore, Error, EventLoggingAdapter,
    PersistentStorage, Result, SpecsAdapter,
};

/// Configuration for [`Engine`](crate::Engine).
///
/// Plain settings can be loaded from JSON with [`EngineOptions::from_json`], accepting both
/// `camelCase` and `snake_case` keys. Adapters and storage are set with the `with_*` methods.
///
/// ```
/// # use std::time::Duration;
/// # use switchyard::EngineOptions;
/// let options = EngineOptions::default()
///     .with_environment("staging")
///     .with_specs_sync_interval(Duration::from_secs(30));
/// ```
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    #[serde(default, alias = "specs_url")]
    pub specs_url: Option<String>,
    #[serde(default, alias = "log_event_url")]
    pub log_event_url: Option<String>,
    #[serde(default, alias = "specs_sync_interval_ms")]
    pub specs_sync_interval_ms: Option<u64>,
    #[serde(default, alias = "event_logging_flush_interval_ms")]
    pub event_logging_flush_interval_ms: Option<u64>,
    #[serde(default, alias = "event_logging_max_queue_size")]
    pub event_logging_max_queue_size: Option<usize>,
    /// Events per request, and the queue length that triggers a flush.
    #[serde(default, alias = "event_logging_batch_size")]
    pub event_logging_batch_size: Option<usize>,
    /// Environment tier applied to users that do not carry one.
    #[serde(default)]
    pub environment: Option<String>,
    /// Skip HTTP adapters. Custom adapters are still used.
    #[serde(default, alias = "disable_network")]
    pub disable_network: bool,
    /// Record no events at all.
    #[serde(default, alias = "disable_all_logging")]
    pub disable_all_logging: bool,
    #[serde(default, alias = "enable_id_lists")]
    pub enable_id_lists: bool,
    #[serde(default, alias = "id_lists_url")]
    pub id_lists_url: Option<String>,
    #[serde(default, alias = "id_lists_sync_interval_ms")]
    pub id_lists_sync_interval_ms: Option<u64>,
    #[serde(default, alias = "init_timeout_ms")]
    pub init_timeout_ms: Option<u64>,
    /// Timeout of a single HTTP request.
    #[serde(default, alias = "request_timeout_ms")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, alias = "proxy_config")]
    pub proxy_config: Option<ProxyConfig>,
    /// Retry failed requests to a custom `specs_url` against the default API.
    #[serde(default, alias = "fallback_to_statsig_api")]
    pub fallback_to_statsig_api: bool,
    /// Accepted for compatibility. Country lookup is not performed.
    #[serde(default, alias = "wait_for_country_lookup_init")]
    pub wait_for_country_lookup_init: bool,
    /// Accepted for compatibility. User agent parsing is not performed.
    #[serde(default, alias = "wait_for_user_agent_init")]
    pub wait_for_user_agent_init: bool,
    /// Specs payload applied synchronously on initialize, with source `Bootstrap`.
    #[serde(default, alias = "bootstrap_specs")]
    pub bootstrap_specs: Option<String>,

    #[serde(skip)]
    pub specs_adapter: Option<Arc<dyn SpecsAdapter>>,
    #[serde(skip)]
    pub event_logging_adapter: Option<Arc<dyn EventLoggingAdapter>>,
    #[serde(skip)]
    pub persistent_storage: Option<Arc<dyn PersistentStorage>>,
    /// Network payloads are written through to the data store.
    #[serde(skip)]
    pub data_store: Option<Arc<dyn DataStore>>,
}

/// Outbound HTTP proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, alias = "proxy_host")]
    pub proxy_host: Option<String>,
    #[serde(default, alias = "proxy_port")]
    pub proxy_port: Option<u16>,
    /// `user:password`
    #[serde(default, alias = "proxy_auth")]
    pub proxy_auth: Option<String>,
    /// `http` unless set.
    #[serde(default, alias = "proxy_protocol")]
    pub proxy_protocol: Option<String>,
}

impl ProxyConfig {
    fn url(&self) -> Option<String> {
        let host = self.proxy_host.as_deref()?;
        let protocol = self.proxy_protocol.as_deref().unwrap_or("http");
        Some(match self.proxy_port {
            Some(port) => format!("{protocol}://{host}:{port}"),
            None => format!("{protocol}://{host}"),
        })
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("specs_url", &self.specs_url)
            .field("log_event_url", &self.log_event_url)
            .field("specs_sync_interval_ms", &self.specs_sync_interval_ms)
            .field("environment", &self.environment)
            .field("disable_network", &self.disable_network)
            .field("disable_all_logging", &self.disable_all_logging)
            .field("enable_id_lists", &self.enable_id_lists)
            .field("proxy_config", &self.proxy_config)
            .field("has_specs_adapter", &self.specs_adapter.is_some())
            .field("has_event_logging_adapter", &self.event_logging_adapter.is_some())
            .field("has_persistent_storage", &self.persistent_storage.is_some())
            .field("has_data_store", &self.data_store.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineOptions {
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_ID_LISTS_SYNC_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> EngineOptions {
        EngineOptions::default()
    }

    /// Parse options from JSON. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<EngineOptions> {
        serde_json::from_str(json).map_err(|err| Error::InvalidOptions(err.to_string()))
    }

    /// Check configured URLs and numeric settings.
    pub fn validate(&self) -> Result<()> {
        for url in [&self.specs_url, &self.log_event_url, &self.id_lists_url]
            .into_iter()
            .flatten()
        {
            Url::parse(url)?;
        }

        let intervals = [
            ("specs_sync_interval_ms", self.specs_sync_interval_ms),
            (
                "event_logging_flush_interval_ms",
                self.event_logging_flush_interval_ms,
            ),
            ("id_lists_sync_interval_ms", self.id_lists_sync_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == Some(0) {
                return Err(Error::InvalidOptions(format!("{name} must be positive")));
            }
        }
        let sizes = [
            ("event_logging_max_queue_size", self.event_logging_max_queue_size),
            ("event_logging_batch_size", self.event_logging_batch_size),
        ];
        for (name, value) in sizes {
            if value == Some(0) {
                return Err(Error::InvalidOptions(format!("{name} must be positive")));
            }
        }

        if let Some(proxy) = &self.proxy_config {
            if let Some(url) = proxy.url() {
                Url::parse(&url)?;
            }
        }
        Ok(())
    }

    pub fn specs_sync_interval(&self) -> Duration {
        self.specs_sync_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(HttpSpecsAdapter::DEFAULT_SYNC_INTERVAL)
    }

    pub fn event_logging_flush_interval(&self) -> Duration {
        self.event_logging_flush_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(EventLogger::DEFAULT_FLUSH_INTERVAL)
    }

    pub fn event_logging_max_queue_size(&self) -> usize {
        self.event_logging_max_queue_size
            .unwrap_or(EventLogger::DEFAULT_MAX_QUEUE_SIZE)
    }

    pub fn event_logging_batch_size(&self) -> usize {
        self.event_logging_batch_size
            .unwrap_or(EventLogger::DEFAULT_BATCH_SIZE)
    }

    pub fn id_lists_sync_interval(&self) -> Duration {
        self.id_lists_sync_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_ID_LISTS_SYNC_INTERVAL)
    }

    pub fn init_timeout(&self) -> Duration {
        self.init_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_INIT_TIMEOUT)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_specs_url(mut self, url: impl Into<String>) -> Self {
        self.specs_url = Some(url.into());
        self
    }

    pub fn with_log_event_url(mut self, url: impl Into<String>) -> Self {
        self.log_event_url = Some(url.into());
        self
    }

    pub fn with_specs_sync_interval(mut self, interval: Duration) -> Self {
        self.specs_sync_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_event_logging_flush_interval(mut self, interval: Duration) -> Self {
        self.event_logging_flush_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_event_logging_max_queue_size(mut self, size: usize) -> Self {
        self.event_logging_max_queue_size = Some(size);
        self
    }

    pub fn with_event_logging_batch_size(mut self, size: usize) -> Self {
        self.event_logging_batch_size = Some(size);
        self
    }

    pub fn with_environment(mut self, tier: impl Into<String>) -> Self {
        self.environment = Some(tier.into());
        self
    }

    pub fn with_disable_network(mut self, disable_network: bool) -> Self {
        self.disable_network = disable_network;
        self
    }

    pub fn with_disable_all_logging(mut self, disable_all_logging: bool) -> Self {
        self.disable_all_logging = disable_all_logging;
        self
    }

    pub fn with_id_lists(mut self, enable: bool) -> Self {
        self.enable_id_lists = enable;
        self
    }

    pub fn with_id_lists_url(mut self, url: impl Into<String>) -> Self {
        self.id_lists_url = Some(url.into());
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_proxy_config(mut self, proxy_config: ProxyConfig) -> Self {
        self.proxy_config = Some(proxy_config);
        self
    }

    pub fn with_fallback_to_statsig_api(mut self, fallback: bool) -> Self {
        self.fallback_to_statsig_api = fallback;
        self
    }

    pub fn with_bootstrap_specs(mut self, payload: impl Into<String>) -> Self {
        self.bootstrap_specs = Some(payload.into());
        self
    }

    pub fn with_specs_adapter(mut self, adapter: Arc<dyn SpecsAdapter>) -> Self {
        self.specs_adapter = Some(adapter);
        self
    }

    pub fn with_event_logging_adapter(mut self, adapter: Arc<dyn EventLoggingAdapter>) -> Self {
        self.event_logging_adapter = Some(adapter);
        self
    }

    pub fn with_persistent_storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.persistent_storage = Some(storage);
        self
    }

    pub fn with_data_store(mut self, data_store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(data_store);
        self
    }
}

/// Blocking HTTP client honoring the request timeout and proxy settings.
pub(crate) fn build_http_client(options: &EngineOptions) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder().timeout(options.request_timeout());

    if let Some(proxy_url) = options.proxy_config.as_ref().and_then(ProxyConfig::url) {
        let mut proxy = reqwest::Proxy::all(proxy_url)?;
        if let Some(auth) = options
            .proxy_config
            .as_ref()
            .and_then(|proxy| proxy.proxy_auth.as_deref())
        {
            let (username, password) = auth.split_once(':').unwrap_or((auth, ""));
            proxy = proxy.basic_auth(username, password);
        }
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}
