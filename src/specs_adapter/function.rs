use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    error::guard_host_call,
    spec_store::{SpecsInfo, SpecsSource, SpecsUpdate, SpecsUpdateListener},
    unix_time_millis, Error, Result,
};

use super::SpecsAdapter;

type StartHook = dyn Fn(SpecsPushHandle) -> std::result::Result<(), String> + Send + Sync;
type Hook = dyn Fn() -> std::result::Result<(), String> + Send + Sync;

/// Handle given to host code to push payloads into the engine.
///
/// Holds the store weakly: pushing after the engine is gone is an error, not a leak.
#[derive(Clone)]
pub struct SpecsPushHandle {
    listener: Weak<dyn SpecsUpdateListener>,
    source: SpecsSource,
}

impl SpecsPushHandle {
    pub fn push(&self, data: impl Into<String>) -> Result<()> {
        let listener = self
            .listener
            .upgrade()
            .ok_or(Error::InvalidState(crate::EngineState::Shutdown))?;
        listener.did_receive_specs_update(SpecsUpdate {
            data: data.into(),
            source: self.source.clone(),
            received_at: unix_time_millis(),
        })
    }

    /// Version information, so host code can request deltas.
    pub fn current_specs_info(&self) -> Option<SpecsInfo> {
        self.listener
            .upgrade()
            .map(|listener| listener.get_current_specs_info())
    }
}

/// Adapter whose lifecycle and scheduling are implemented by the embedding host.
///
/// Hook errors and panics are caught and surface as [`Error::AdapterCallbackFailure`].
pub struct FunctionSpecsAdapter {
    name: String,
    on_start: Arc<StartHook>,
    on_schedule_background_sync: Option<Arc<Hook>>,
    on_shutdown: Option<Arc<Hook>>,
    listener: Mutex<Option<Arc<dyn SpecsUpdateListener>>>,
}

impl FunctionSpecsAdapter {
    /// `name` becomes the [`SpecsSource::Adapter`] of pushed payloads.
    pub fn new<F>(name: impl Into<String>, on_start: F) -> FunctionSpecsAdapter
    where
        F: Fn(SpecsPushHandle) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        FunctionSpecsAdapter {
            name: name.into(),
            on_start: Arc::new(on_start),
            on_schedule_background_sync: None,
            on_shutdown: None,
            listener: Mutex::new(None),
        }
    }

    pub fn with_schedule_background_sync<F>(mut self, hook: F) -> FunctionSpecsAdapter
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_schedule_background_sync = Some(Arc::new(hook));
        self
    }

    pub fn with_shutdown<F>(mut self, hook: F) -> FunctionSpecsAdapter
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(hook));
        self
    }
}

impl SpecsAdapter for FunctionSpecsAdapter {
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        let handle = SpecsPushHandle {
            listener: Arc::downgrade(&listener),
            source: SpecsSource::Adapter(self.name.clone()),
        };
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
        guard_host_call("specs adapter start", || (self.on_start)(handle))
    }

    fn schedule_background_sync(&self) -> Result<()> {
        match &self.on_schedule_background_sync {
            Some(hook) => guard_host_call("specs adapter schedule_background_sync", || hook()),
            None => Ok(()),
        }
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        match &self.on_shutdown {
            Some(hook) => guard_host_call("specs adapter shutdown", || hook()),
            None => Ok(()),
        }
    }

    fn type_name(&self) -> String {
        format!("FunctionSpecsAdapter({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use crate::{
        spec_store::{SpecStore, SpecsSource},
        specs_adapter::SpecsAdapter,
        Error,
    };

    use super::{FunctionSpecsAdapter, SpecsPushHandle};

    #[test]
    fn host_pushes_through_handle() {
        let saved: Arc<Mutex<Option<SpecsPushHandle>>> = Arc::default();
        let adapter = {
            let saved = saved.clone();
            FunctionSpecsAdapter::new("host", move |handle| {
                handle
                    .push(r#"{"time": 1}"#)
                    .map_err(|err| err.to_string())?;
                *saved.lock().unwrap() = Some(handle);
                Ok(())
            })
        };

        let store = Arc::new(SpecStore::new());
        adapter.start(store.clone()).unwrap();
        assert_eq!(
            store.current_specs_info().source,
            SpecsSource::Adapter("host".to_owned())
        );

        let handle = saved.lock().unwrap().clone().unwrap();
        handle.push(r#"{"time": 2}"#).unwrap();
        assert_eq!(handle.current_specs_info().unwrap().lcut, Some(2));
    }

    #[test]
    fn hook_failures_are_reported() {
        let adapter = FunctionSpecsAdapter::new("host", |_| Err("no specs".to_owned()))
            .with_shutdown(|| panic!("host bug"));

        let store = Arc::new(SpecStore::new());
        assert!(matches!(
            adapter.start(store),
            Err(Error::AdapterCallbackFailure(_))
        ));
        assert!(matches!(
            adapter.shutdown(Duration::from_secs(1)),
            Err(Error::AdapterCallbackFailure(_))
        ));
    }

    #[test]
    fn push_after_store_dropped_fails() {
        let saved: Arc<Mutex<Option<SpecsPushHandle>>> = Arc::default();
        let adapter = {
            let saved = saved.clone();
            FunctionSpecsAdapter::new("host", move |handle| {
                *saved.lock().unwrap() = Some(handle);
                Ok(())
            })
        };
        adapter.start(Arc::new(SpecStore::new())).unwrap();
        adapter.shutdown(Duration::from_secs(1)).unwrap();

        let handle = saved.lock().unwrap().clone().unwrap();
        assert!(handle.push(r#"{"time": 1}"#).is_err());
    }
}
