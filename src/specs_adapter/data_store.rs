use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::{
    poller::{PollOutcome, PollerConfig, PollerThread},
    spec_store::{SpecsSource, SpecsUpdate, SpecsUpdateListener},
    unix_time_millis, Error, Result,
};

use super::SpecsAdapter;

const DATA_STORE_SOURCE: &str = "DataStore";

/// Host-provided key-value storage shared between engine instances.
///
/// The engine reads specs from it through [`DataStoreSpecsAdapter`] and writes network payloads
/// back to it when configured with
/// [`EngineOptions::with_data_store`](crate::EngineOptions::with_data_store).
pub trait DataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`. `time` is when the value was received, in milliseconds.
    fn set(&self, key: &str, value: &str, time: Option<u64>) -> Result<()>;

    /// Whether the engine should poll `key` for updates.
    fn supports_polling_updates_for(&self, key: &str) -> bool;
}

/// Key specs payloads are stored under, shared with other deployed SDKs.
pub(crate) fn data_store_key(sdk_key: &str) -> String {
    let hashed = STANDARD.encode(Sha256::digest(sdk_key.as_bytes()));
    format!("statsig|/v2/download_config_specs|plain_text|{hashed}")
}

/// Pulls specs from a [`DataStore`].
pub struct DataStoreSpecsAdapter {
    data_store: Arc<dyn DataStore>,
    key: String,
    sync_interval: Duration,
    listener: Mutex<Option<Arc<dyn SpecsUpdateListener>>>,
    poller: Mutex<Option<PollerThread>>,
}

impl DataStoreSpecsAdapter {
    pub fn new(
        sdk_key: &str,
        data_store: Arc<dyn DataStore>,
        sync_interval: Duration,
    ) -> DataStoreSpecsAdapter {
        DataStoreSpecsAdapter {
            data_store,
            key: data_store_key(sdk_key),
            sync_interval,
            listener: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }
}

fn pull(data_store: &dyn DataStore, key: &str, listener: &dyn SpecsUpdateListener) -> Result<()> {
    let data = data_store
        .get(key)?
        .ok_or_else(|| Error::AdapterCallbackFailure("data store has no specs".to_owned()))?;
    listener.did_receive_specs_update(SpecsUpdate {
        data,
        source: SpecsSource::Adapter(DATA_STORE_SOURCE.to_owned()),
        received_at: unix_time_millis(),
    })
}

impl SpecsAdapter for DataStoreSpecsAdapter {
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener.clone());
        }
        pull(self.data_store.as_ref(), &self.key, listener.as_ref())
    }

    fn schedule_background_sync(&self) -> Result<()> {
        if !self.data_store.supports_polling_updates_for(&self.key) {
            log::debug!(target: "switchyard", "data store does not support polling, skipping background sync");
            return Ok(());
        }
        let Some(listener) = self.listener.lock().ok().and_then(|slot| slot.clone()) else {
            return Err(Error::InvalidState(crate::EngineState::Uninitialized));
        };
        let listener: Weak<dyn SpecsUpdateListener> = Arc::downgrade(&listener);
        let data_store = Arc::clone(&self.data_store);
        let key = self.key.clone();

        let poller = PollerThread::start(
            "switchyard-data-store",
            PollerConfig::new(self.sync_interval),
            move || {
                let Some(listener) = listener.upgrade() else {
                    return PollOutcome::Stop;
                };
                match pull(data_store.as_ref(), &key, listener.as_ref()) {
                    Ok(()) | Err(Error::StaleUpdate { .. }) => PollOutcome::Continue,
                    Err(err) => {
                        log::warn!(target: "switchyard", "data store sync failed: {err}");
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
        "DataStoreSpecsAdapter".to_owned()
    }
}
