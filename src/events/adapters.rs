use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use reqwest::{
    header::{HeaderName, HeaderValue},
    StatusCode, Url,
};

use crate::{
    error::guard_host_call,
    options::{build_http_client, EngineOptions},
    Result,
};

use super::LogEventRequest;

pub const DEFAULT_LOG_EVENT_URL: &str = "https://prodregistryv2.org/v1/log_event";

/// Destination of flushed event batches.
///
/// Any `Fn(&LogEventRequest) -> Result<()>` closure is an adapter.
pub trait EventLoggingAdapter: Send + Sync {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Deliver one batch. A failed batch is dropped by the caller.
    fn log_events(&self, request: &LogEventRequest) -> Result<()>;

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: Fn(&LogEventRequest) -> Result<()> + Send + Sync> EventLoggingAdapter for T {
    fn log_events(&self, request: &LogEventRequest) -> Result<()> {
        self(request)
    }
}

/// Discards all events. Used when network access is disabled.
pub struct NoopEventLoggingAdapter;

impl EventLoggingAdapter for NoopEventLoggingAdapter {
    fn log_events(&self, _request: &LogEventRequest) -> Result<()> {
        Ok(())
    }
}

/// Posts batches to the log event endpoint.
pub struct HttpEventLoggingAdapter {
    client: reqwest::blocking::Client,
    sdk_key: String,
    url: Url,
}

impl HttpEventLoggingAdapter {
    pub fn new(sdk_key: &str, options: &EngineOptions) -> Result<HttpEventLoggingAdapter> {
        let url = Url::parse(
            options
                .log_event_url
                .as_deref()
                .unwrap_or(DEFAULT_LOG_EVENT_URL),
        )?;
        Ok(HttpEventLoggingAdapter {
            client: build_http_client(options)?,
            sdk_key: sdk_key.to_owned(),
            url,
        })
    }
}

impl EventLoggingAdapter for HttpEventLoggingAdapter {
    fn log_events(&self, request: &LogEventRequest) -> Result<()> {
        let mut headers = request.statsig_metadata.headers(&self.sdk_key);
        headers.insert(
            HeaderName::from_static("statsig-event-count"),
            HeaderValue::from(request.events.len()),
        );

        let response = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .json(request)
            .send()?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(crate::Error::Unauthorized);
        }
        if !status.is_success() {
            return Err(crate::Error::UnexpectedStatus(status.as_u16()));
        }

        log::debug!(target: "switchyard", event_count = request.events.len(); "posted event batch");
        Ok(())
    }
}

/// Appends each batch as one JSON line to a file.
pub struct LocalFileEventLoggingAdapter {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFileEventLoggingAdapter {
    pub fn new(path: impl Into<PathBuf>) -> LocalFileEventLoggingAdapter {
        LocalFileEventLoggingAdapter {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl EventLoggingAdapter for LocalFileEventLoggingAdapter {
    fn log_events(&self, request: &LogEventRequest) -> Result<()> {
        let mut line = serde_json::to_vec(request)
            .map_err(|err| crate::Error::MalformedPayload(err.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

type LogHook = dyn Fn(&LogEventRequest) -> std::result::Result<(), String> + Send + Sync;
type Hook = dyn Fn() -> std::result::Result<(), String> + Send + Sync;

/// Adapter delegating delivery to host code. Errors and panics of the hooks surface as
/// [`Error::AdapterCallbackFailure`](crate::Error::AdapterCallbackFailure).
pub struct FunctionEventLoggingAdapter {
    on_log_events: Arc<LogHook>,
    on_start: Option<Arc<Hook>>,
    on_shutdown: Option<Arc<Hook>>,
}

impl FunctionEventLoggingAdapter {
    pub fn new<F>(on_log_events: F) -> FunctionEventLoggingAdapter
    where
        F: Fn(&LogEventRequest) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        FunctionEventLoggingAdapter {
            on_log_events: Arc::new(on_log_events),
            on_start: None,
            on_shutdown: None,
        }
    }

    pub fn with_start<F>(mut self, hook: F) -> FunctionEventLoggingAdapter
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn with_shutdown<F>(mut self, hook: F) -> FunctionEventLoggingAdapter
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(hook));
        self
    }
}

impl EventLoggingAdapter for FunctionEventLoggingAdapter {
    fn start(&self) -> Result<()> {
        match &self.on_start {
            Some(hook) => guard_host_call("event logging adapter start", || hook()),
            None => Ok(()),
        }
    }

    fn log_events(&self, request: &LogEventRequest) -> Result<()> {
        guard_host_call("event logging adapter log_events", || {
            (self.on_log_events)(request)
        })
    }

    fn shutdown(&self) -> Result<()> {
        match &self.on_shutdown {
            Some(hook) => guard_host_call("event logging adapter shutdown", || hook()),
            None => Ok(()),
        }
    }
}
