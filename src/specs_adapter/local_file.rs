use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::{Duration, SystemTime},
};

use crate::{
    options::EngineOptions,
    poller::{PollOutcome, PollerConfig, PollerThread},
    spec_store::{SpecsSource, SpecsUpdate, SpecsUpdateListener},
    unix_time_millis, Error, Result,
};

use super::{SpecsAdapter, SpecsFetcher};

/// Reads specs from a file on disk.
///
/// With a network fallback configured, a missing file (or one older than `max_age`) is refreshed
/// from the specs endpoint and the payload is written back to the file.
pub struct LocalFileSpecsAdapter {
    path: PathBuf,
    reread_interval: Option<Duration>,
    max_age: Option<Duration>,
    fetcher: Option<Arc<SpecsFetcher>>,
    listener: Mutex<Option<Arc<dyn SpecsUpdateListener>>>,
    poller: Mutex<Option<PollerThread>>,
}

impl LocalFileSpecsAdapter {
    pub fn new(path: impl Into<PathBuf>) -> LocalFileSpecsAdapter {
        LocalFileSpecsAdapter {
            path: path.into(),
            reread_interval: None,
            max_age: None,
            fetcher: None,
            listener: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    /// Re-read the file periodically after start.
    pub fn with_reread_interval(mut self, interval: Duration) -> LocalFileSpecsAdapter {
        self.reread_interval = Some(interval);
        self
    }

    /// Download specs when the file is absent or older than `max_age`. Does nothing when
    /// `options.disable_network` is set.
    pub fn with_network_fallback(
        mut self,
        sdk_key: &str,
        options: &EngineOptions,
        max_age: Option<Duration>,
    ) -> Result<LocalFileSpecsAdapter> {
        if options.disable_network {
            log::debug!(target: "switchyard", "network disabled, reading specs from {} only", self.path.display());
            return Ok(self);
        }
        self.fetcher = Some(Arc::new(SpecsFetcher::from_options(sdk_key, options)?));
        self.max_age = max_age;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Download specs and write them to the file, returning the payload.
    pub fn fetch_and_write_to_file(&self) -> Result<String> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| Error::InvalidOptions("no network fallback configured".to_owned()))?;
        let data = fetcher.fetch(None)?;
        fs::write(&self.path, &data)?;
        log::debug!(target: "switchyard", "wrote specs to {}", self.path.display());
        Ok(data)
    }

    fn needs_refresh(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return true;
        };
        match (self.max_age, metadata.modified()) {
            (Some(max_age), Ok(modified)) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > max_age)
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn push_file(path: &Path, listener: &dyn SpecsUpdateListener) -> Result<()> {
    let data = fs::read_to_string(path)?;
    listener.did_receive_specs_update(SpecsUpdate {
        data,
        source: SpecsSource::Cache,
        received_at: unix_time_millis(),
    })
}

impl SpecsAdapter for LocalFileSpecsAdapter {
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener.clone());
        }

        if self.fetcher.is_some() && self.needs_refresh() {
            match self.fetch_and_write_to_file() {
                Ok(data) => {
                    return listener.did_receive_specs_update(SpecsUpdate {
                        data,
                        source: SpecsSource::Network,
                        received_at: unix_time_millis(),
                    });
                }
                Err(err) => {
                    log::warn!(target: "switchyard", "failed to refresh specs file, using existing file: {err}");
                }
            }
        }

        push_file(&self.path, listener.as_ref())
    }

    fn schedule_background_sync(&self) -> Result<()> {
        let Some(interval) = self.reread_interval else {
            return Ok(());
        };
        let Some(listener) = self.listener.lock().ok().and_then(|slot| slot.clone()) else {
            return Err(Error::InvalidState(crate::EngineState::Uninitialized));
        };
        let listener: Weak<dyn SpecsUpdateListener> = Arc::downgrade(&listener);
        let path = self.path.clone();

        let poller = PollerThread::start(
            "switchyard-specs-file",
            PollerConfig::new(interval).with_jitter(Duration::ZERO),
            move || {
                let Some(listener) = listener.upgrade() else {
                    return PollOutcome::Stop;
                };
                match push_file(&path, listener.as_ref()) {
                    // Re-reading an unchanged file is rejected as stale.
                    Ok(()) | Err(Error::StaleUpdate { .. }) => PollOutcome::Continue,
                    Err(err) => {
                        log::warn!(target: "switchyard", "failed to re-read specs file: {err}");
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
        "LocalFileSpecsAdapter".to_owned()
    }
}
