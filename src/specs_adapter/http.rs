use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use reqwest::{header::HeaderMap, StatusCode, Url};

use crate::{
    options::{build_http_client, EngineOptions},
    poller::{PollOutcome, PollerConfig, PollerThread},
    spec_store::{SpecsSource, SpecsUpdate, SpecsUpdateListener},
    unix_time_millis, Error, Result, SdkMetadata,
};

use super::SpecsAdapter;

pub const DEFAULT_SPECS_URL: &str = "https://api.statsigcdn.com/v2/download_config_specs";

/// An HTTP client that downloads specs payloads.
pub(crate) struct SpecsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    sdk_key: String,
    base_url: Url,
    /// Default API, used when a request to a custom `base_url` fails.
    fallback_url: Option<Url>,
    headers: HeaderMap,
    /// If we receive a 401 Unauthorized error during a request, the sdk key is not valid. We cache
    /// this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl SpecsFetcher {
    pub fn new(
        client: reqwest::blocking::Client,
        sdk_key: &str,
        base_url: Url,
        fallback_url: Option<Url>,
        headers: HeaderMap,
    ) -> SpecsFetcher {
        SpecsFetcher {
            client,
            sdk_key: sdk_key.to_owned(),
            base_url,
            fallback_url,
            headers,
            unauthorized: AtomicBool::new(false),
        }
    }

    /// The default API is the fallback when `fallback_to_statsig_api` is set and `specs_url`
    /// points elsewhere.
    pub fn from_options(sdk_key: &str, options: &EngineOptions) -> Result<SpecsFetcher> {
        let base_url = Url::parse(options.specs_url.as_deref().unwrap_or(DEFAULT_SPECS_URL))?;
        let default_url = Url::parse(DEFAULT_SPECS_URL)?;
        let fallback_url =
            (options.fallback_to_statsig_api && base_url != default_url).then_some(default_url);
        Ok(SpecsFetcher::new(
            build_http_client(options)?,
            sdk_key,
            base_url,
            fallback_url,
            SdkMetadata::new().headers(sdk_key),
        ))
    }

    /// Download the payload, asking only for changes since `since_time` when given.
    pub fn fetch(&self, since_time: Option<u64>) -> Result<String> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        match self.fetch_from(&self.base_url, since_time) {
            Err(err @ Error::Unauthorized) => Err(err),
            Err(err) => match &self.fallback_url {
                Some(fallback_url) => {
                    log::warn!(target: "switchyard", "specs request failed, falling back to default api: {err}");
                    self.fetch_from(fallback_url, since_time)
                }
                None => Err(err),
            },
            ok => ok,
        }
    }

    fn fetch_from(&self, base_url: &Url, since_time: Option<u64>) -> Result<String> {
        let url = specs_url(base_url, &self.sdk_key, since_time)?;

        log::debug!(target: "switchyard", "fetching specs");
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()?;

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "switchyard", "client is not authorized. Check your sdk key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "switchyard", "received non-200 response while fetching specs: {err:?}");
                match err.status() {
                    Some(status) => Error::UnexpectedStatus(status.as_u16()),
                    None => Error::from(err),
                }
            }
        })?;

        let body = response.text()?;
        log::debug!(target: "switchyard", bytes = body.len(); "successfully fetched specs");
        Ok(body)
    }
}

/// `{base}/{sdk_key}.json?sinceTime={lcut}`
fn specs_url(base_url: &Url, sdk_key: &str, since_time: Option<u64>) -> Result<Url> {
    let mut url = Url::parse(&format!(
        "{}/{}.json",
        base_url.as_str().trim_end_matches('/'),
        sdk_key
    ))?;
    if let Some(since_time) = since_time {
        url.query_pairs_mut()
            .append_pair("sinceTime", &since_time.to_string());
    }
    Ok(url)
}

/// Polls the specs endpoint on a background thread.
pub struct HttpSpecsAdapter {
    fetcher: Arc<SpecsFetcher>,
    sync_interval: Duration,
    listener: Mutex<Option<Arc<dyn SpecsUpdateListener>>>,
    poller: Mutex<Option<PollerThread>>,
}

impl HttpSpecsAdapter {
    pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(sdk_key: &str, options: &EngineOptions) -> Result<HttpSpecsAdapter> {
        Ok(HttpSpecsAdapter::with_fetcher(
            SpecsFetcher::from_options(sdk_key, options)?,
            options.specs_sync_interval(),
        ))
    }

    pub(crate) fn with_fetcher(fetcher: SpecsFetcher, sync_interval: Duration) -> HttpSpecsAdapter {
        HttpSpecsAdapter {
            fetcher: Arc::new(fetcher),
            sync_interval,
            listener: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn SpecsUpdateListener>> {
        self.listener.lock().ok()?.clone()
    }
}

/// Fetch once and push the payload. Listener errors (stale or malformed payloads) are not
/// transport failures and do not trigger backoff.
fn sync_once(fetcher: &SpecsFetcher, listener: &dyn SpecsUpdateListener) -> Result<()> {
    let since_time = listener.get_current_specs_info().lcut;
    let data = fetcher.fetch(since_time)?;
    let _ = listener.did_receive_specs_update(SpecsUpdate {
        data,
        source: SpecsSource::Network,
        received_at: unix_time_millis(),
    });
    Ok(())
}

impl SpecsAdapter for HttpSpecsAdapter {
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener.clone());
        }
        sync_once(&self.fetcher, listener.as_ref())
    }

    fn schedule_background_sync(&self) -> Result<()> {
        let Some(listener) = self.current_listener() else {
            return Err(Error::InvalidState(crate::EngineState::Uninitialized));
        };
        let fetcher = Arc::clone(&self.fetcher);
        let listener: Weak<dyn SpecsUpdateListener> = Arc::downgrade(&listener);

        let poller = PollerThread::start(
            "switchyard-specs-poller",
            PollerConfig::new(self.sync_interval),
            move || {
                let Some(listener) = listener.upgrade() else {
                    return PollOutcome::Stop;
                };
                match sync_once(&fetcher, listener.as_ref()) {
                    Ok(()) => PollOutcome::Continue,
                    Err(Error::Unauthorized) => PollOutcome::Stop,
                    Err(err) => {
                        log::warn!(target: "switchyard", "specs sync failed: {err}");
                        PollOutcome::Failed
                    }
                }
            },
        )?;

        if let Ok(mut slot) = self.poller.lock() {
            if let Some(previous) = slot.replace(poller) {
                previous.stop();
            }
        }
        Ok(())
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        let poller = self.poller.lock().ok().and_then(|mut slot| slot.take());
        match poller {
            Some(poller) => poller.shutdown(timeout),
            None => Ok(()),
        }
    }

    fn type_name(&self) -> String {
        "HttpSpecsAdapter".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use reqwest::{header::HeaderMap, Url};

    use crate::{
        spec_store::SpecStore,
        specs_adapter::SpecsAdapter,
        EngineOptions, Error,
    };

    use super::{specs_url, HttpSpecsAdapter, SpecsFetcher, DEFAULT_SPECS_URL};

    /// Local HTTP server answering with scripted `(status, body)` pairs. The last one repeats.
    struct ScriptedServer {
        url: Url,
        paths: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedServer {
        fn start(responses: Vec<(u16, &'static str)>) -> ScriptedServer {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = Url::parse(&format!(
                "http://{}/v2/download_config_specs",
                listener.local_addr().unwrap()
            ))
            .unwrap();
            let paths = Arc::new(Mutex::new(Vec::new()));

            let recorded = paths.clone();
            std::thread::spawn(move || {
                let mut responses = responses.into_iter();
                let mut current = (404, "");
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else {
                        return;
                    };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    reader.read_line(&mut request_line).unwrap();
                    loop {
                        let mut header = String::new();
                        if reader.read_line(&mut header).unwrap_or(0) <= 2 {
                            break;
                        }
                    }
                    let path = request_line.split_whitespace().nth(1).unwrap_or_default();
                    recorded.lock().unwrap().push(path.to_owned());

                    if let Some(next) = responses.next() {
                        current = next;
                    }
                    let (status, body) = current;
                    let _ = write!(
                        stream,
                        "HTTP/1.1 {status} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                }
            });

            ScriptedServer { url, paths }
        }

        fn request_count(&self) -> usize {
            self.paths.lock().unwrap().len()
        }

        fn fetcher(&self, fallback: Option<&ScriptedServer>) -> SpecsFetcher {
            let client = reqwest::blocking::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap();
            SpecsFetcher::new(
                client,
                "secret-key",
                self.url.clone(),
                fallback.map(|server| server.url.clone()),
                HeaderMap::new(),
            )
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn builds_specs_url() {
        let base = Url::parse("https://example.com/v2/download_config_specs/").unwrap();
        assert_eq!(
            specs_url(&base, "secret-key", None).unwrap().as_str(),
            "https://example.com/v2/download_config_specs/secret-key.json"
        );
        assert_eq!(
            specs_url(&base, "secret-key", Some(123)).unwrap().as_str(),
            "https://example.com/v2/download_config_specs/secret-key.json?sinceTime=123"
        );
    }

    #[test]
    fn fallback_only_for_custom_specs_url() {
        let custom = EngineOptions::default()
            .with_specs_url("https://specs.example.com/v2")
            .with_fallback_to_statsig_api(true);
        let fetcher = SpecsFetcher::from_options("secret-key", &custom).unwrap();
        assert_eq!(fetcher.fallback_url.as_ref().map(Url::as_str), Some(DEFAULT_SPECS_URL));

        let default = EngineOptions::default().with_fallback_to_statsig_api(true);
        assert!(SpecsFetcher::from_options("secret-key", &default)
            .unwrap()
            .fallback_url
            .is_none());
    }

    #[test]
    fn unauthorized_stops_further_requests() {
        let server = ScriptedServer::start(vec![(401, "")]);
        let fetcher = server.fetcher(None);

        assert!(matches!(fetcher.fetch(None), Err(Error::Unauthorized)));
        assert!(matches!(fetcher.fetch(None), Err(Error::Unauthorized)));
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn failed_request_falls_back() {
        let primary = ScriptedServer::start(vec![(500, "")]);
        let fallback = ScriptedServer::start(vec![(200, r#"{"time": 3}"#)]);
        let fetcher = primary.fetcher(Some(&fallback));

        assert_eq!(fetcher.fetch(Some(2)).unwrap(), r#"{"time": 3}"#);
        assert_eq!(primary.request_count(), 1);
        assert_eq!(
            *fallback.paths.lock().unwrap(),
            ["/v2/download_config_specs/secret-key.json?sinceTime=2"]
        );
    }

    #[test]
    fn unauthorized_does_not_fall_back() {
        let primary = ScriptedServer::start(vec![(401, "")]);
        let fallback = ScriptedServer::start(vec![(200, r#"{"time": 3}"#)]);
        let fetcher = primary.fetcher(Some(&fallback));

        assert!(matches!(fetcher.fetch(None), Err(Error::Unauthorized)));
        assert_eq!(fallback.request_count(), 0);
    }

    #[test]
    fn background_sync_recovers_after_failures() {
        let server = ScriptedServer::start(vec![(503, ""), (503, ""), (200, r#"{"time": 9}"#)]);
        let adapter = HttpSpecsAdapter::with_fetcher(server.fetcher(None), Duration::from_millis(10));
        let store = Arc::new(SpecStore::new());

        assert!(matches!(
            adapter.start(store.clone()),
            Err(Error::UnexpectedStatus(503))
        ));
        assert!(store.current_snapshot().is_none());

        adapter.schedule_background_sync().unwrap();
        assert!(wait_until(|| store.current_specs_info().lcut == Some(9)));
        assert!(wait_until(|| server
            .paths
            .lock()
            .unwrap()
            .iter()
            .any(|path| path.ends_with("sinceTime=9"))));

        adapter.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(server.paths.lock().unwrap()[0], "/v2/download_config_specs/secret-key.json");
    }

    #[test]
    fn background_sync_stops_when_unauthorized() {
        let server = ScriptedServer::start(vec![(200, r#"{"time": 1}"#), (401, "")]);
        let adapter = HttpSpecsAdapter::with_fetcher(server.fetcher(None), Duration::from_millis(10));
        let store = Arc::new(SpecStore::new());

        adapter.start(store.clone()).unwrap();
        adapter.schedule_background_sync().unwrap();
        assert!(wait_until(|| server.request_count() >= 2));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(server.request_count(), 2);
        assert_eq!(store.current_specs_info().lcut, Some(1));
        adapter.shutdown(Duration::from_secs(1)).unwrap();
    }
}
