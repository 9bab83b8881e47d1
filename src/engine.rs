//! The engine ties specs synchronization, evaluation and event logging together.
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use reqwest::{header::HeaderValue, Url};
use serde_json::{Map, Value};

use crate::{
    client_init::{
        format_client_initialize_response, ClientInitResponseOptions, ClientInitializeResponse,
    },
    decisions::{DynamicConfig, Experiment, FeatureGate, Layer, ParameterStore},
    error::catch_adapter_panic,
    eval::{
        resolve_parameter, EntityKind, EvaluationDetails, EvaluationReason, EvaluationResult,
        EvaluatorContext,
    },
    events::{
        config_exposure, gate_exposure, layer_exposure, Event, EventLogger, Exposure,
        HttpEventLoggingAdapter, NoopEventLoggingAdapter,
    },
    id_lists::{IdListsSyncer, DEFAULT_ID_LISTS_URL},
    options::{build_http_client, EngineOptions},
    overrides::{OverrideStore, OverrideValue},
    sharder::Sha256Sharder,
    spec_store::{SpecStore, SpecsInfo, SpecsSnapshot, SpecsSource, SpecsUpdateListener},
    specs::Parameter,
    specs_adapter::{data_store_key, DataStoreSpecsAdapter, HttpSpecsAdapter, NoopSpecsAdapter},
    unix_time_millis, Error, EventLoggingAdapter, PersistentStorage, Result, SdkMetadata,
    SpecsAdapter, User,
};

/// Timeout used when an engine is dropped without an explicit shutdown.
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::ShuttingDown => "shutting down",
            EngineState::Shutdown => "shut down",
        })
    }
}

/// Per-call evaluation settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationOptions {
    /// Do not record an exposure for this evaluation.
    pub disable_exposure_logging: bool,
    /// Keep active experiment assignments stable through the configured
    /// [`PersistentStorage`].
    pub sticky: bool,
}

impl EvaluationOptions {
    pub fn without_exposure_logging() -> EvaluationOptions {
        EvaluationOptions {
            disable_exposure_logging: true,
            ..EvaluationOptions::default()
        }
    }

    pub fn sticky() -> EvaluationOptions {
        EvaluationOptions {
            sticky: true,
            ..EvaluationOptions::default()
        }
    }
}

/// Outcome of the adapter's first sync, shared with the initialization thread.
type InitSignal = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

/// A feature gate and experimentation engine.
///
/// Evaluations never fail: before specs arrive they return zero values with reason
/// `Uninitialized`. Call [`Engine::shutdown`] to flush pending events before the process exits;
/// dropping the engine does so with a short timeout.
///
/// ```no_run
/// # use switchyard::{Engine, EngineOptions, User};
/// let engine = Engine::new("secret-key", EngineOptions::default())?;
/// engine.initialize_blocking()?;
///
/// let user = User::with_user_id("user-1");
/// if engine.check_gate(&user, "new_checkout") {
///     // ...
/// }
/// engine.shutdown(std::time::Duration::from_secs(5))?;
/// # Ok::<(), switchyard::Error>(())
/// ```
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    store: Arc<SpecStore>,
    overrides: OverrideStore,
    specs_adapter: Arc<dyn SpecsAdapter>,
    /// `None` when all logging is disabled.
    event_logger: Option<Arc<EventLogger>>,
    id_lists_syncer: Option<Arc<IdListsSyncer>>,
    persistent_storage: Option<Arc<dyn PersistentStorage>>,
    state: Mutex<EngineState>,
    init_signal: InitSignal,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("specs_adapter", &self.inner.specs_adapter.type_name())
            .field("specs_info", &self.current_specs_info())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine. No background work starts until [`Engine::initialize`], apart from the
    /// event flush thread.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSdkKey`] if `sdk_key` is empty or cannot be sent in a header.
    /// - [`Error::InvalidUrl`] or [`Error::InvalidOptions`] for bad options.
    pub fn new(sdk_key: &str, options: EngineOptions) -> Result<Engine> {
        if sdk_key.trim().is_empty() || HeaderValue::from_str(sdk_key).is_err() {
            return Err(Error::InvalidSdkKey);
        }
        options.validate()?;

        let metadata = SdkMetadata::new();

        let mut store = SpecStore::new();
        if let Some(data_store) = &options.data_store {
            store = store.with_data_store(data_store.clone(), data_store_key(sdk_key));
        }
        let store = Arc::new(store);

        let specs_adapter = select_specs_adapter(sdk_key, &options)?;

        let event_logger = if options.disable_all_logging {
            None
        } else {
            let adapter = select_event_logging_adapter(sdk_key, &options)?;
            Some(EventLogger::start(
                adapter,
                metadata.clone(),
                options.event_logging_max_queue_size(),
                options.event_logging_batch_size(),
                options.event_logging_flush_interval(),
            )?)
        };

        let id_lists_syncer = if options.enable_id_lists && !options.disable_network {
            let url = Url::parse(options.id_lists_url.as_deref().unwrap_or(DEFAULT_ID_LISTS_URL))?;
            Some(Arc::new(IdListsSyncer::new(
                build_http_client(&options)?,
                url,
                metadata.headers(sdk_key),
                store.clone(),
                options.id_lists_sync_interval(),
            )))
        } else {
            None
        };

        let adapter_name = specs_adapter.type_name();
        log::debug!(target: "switchyard", specs_adapter = adapter_name.as_str(); "created engine");

        Ok(Engine {
            inner: Arc::new(EngineInner {
                persistent_storage: options.persistent_storage.clone(),
                options,
                store,
                overrides: OverrideStore::new(),
                specs_adapter,
                event_logger,
                id_lists_syncer,
                state: Mutex::new(EngineState::Uninitialized),
                init_signal: Arc::new((Mutex::new(None), Condvar::new())),
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Apply bootstrap specs if configured and start syncing in the background. The engine is
    /// `Ready` when this returns, whether or not specs have arrived.
    ///
    /// Calling it again while initializing or ready is a no-op.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().map_err(|_| Error::ThreadPanicked)?;
            let current = *state;
            match current {
                EngineState::Uninitialized => *state = EngineState::Initializing,
                EngineState::Initializing | EngineState::Ready => return Ok(()),
                EngineState::ShuttingDown | EngineState::Shutdown => {
                    return Err(Error::InvalidState(current))
                }
            }
        }

        if let Some(bootstrap) = &self.inner.options.bootstrap_specs {
            if let Err(err) = self
                .inner
                .store
                .apply(bootstrap, SpecsSource::Bootstrap, unix_time_millis())
            {
                log::warn!(target: "switchyard", "failed to apply bootstrap specs: {err}");
            }
        }

        if let Some(syncer) = &self.inner.id_lists_syncer {
            if let Err(err) = syncer.start_background_sync() {
                log::warn!(target: "switchyard", "failed to start id list sync: {err}");
            }
        }

        let spawned = {
            let adapter = self.inner.specs_adapter.clone();
            let listener: Arc<dyn SpecsUpdateListener> = self.inner.store.clone();
            let signal = self.inner.init_signal.clone();
            let engine = Arc::downgrade(&self.inner);
            std::thread::Builder::new()
                .name("switchyard-init".to_owned())
                .spawn(move || {
                    let adapter_name = adapter.type_name();
                    let started =
                        catch_adapter_panic("specs adapter start", || adapter.start(listener));
                    if let Err(err) = &started {
                        log::warn!(target: "switchyard", adapter = adapter_name.as_str(); "first specs sync failed, retrying in the background: {err}");
                    }

                    // Keep polling even when the first sync failed.
                    let scheduled = match engine.upgrade() {
                        Some(engine) => engine.schedule_background_sync(),
                        None => Ok(()),
                    };
                    if let Err(err) = &scheduled {
                        log::warn!(target: "switchyard", adapter = adapter_name.as_str(); "failed to schedule background sync: {err}");
                    }

                    let result = started.and(scheduled);
                    let (lock, condvar) = &*signal;
                    if let Ok(mut slot) = lock.lock() {
                        *slot = Some(result);
                        condvar.notify_all();
                    }
                })
        };

        self.inner.set_state(EngineState::Ready);
        spawned?;
        Ok(())
    }

    /// Like [`Engine::initialize`], then wait up to `init_timeout_ms` for the first sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the first sync has not completed in time. The engine stays
    /// `Ready` and keeps syncing in the background. If the first sync fails its error is
    /// returned, and background polling still retries on the usual interval.
    pub fn initialize_blocking(&self) -> Result<()> {
        self.initialize()?;

        let timeout = self.inner.options.init_timeout();
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &*self.inner.init_signal;
        let mut slot = lock.lock().map_err(|_| Error::ThreadPanicked)?;
        loop {
            if let Some(result) = &*slot {
                return result.clone();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: "initialize",
                    timeout,
                });
            }
            slot = condvar
                .wait_timeout(slot, remaining)
                .map_err(|_| Error::ThreadPanicked)?
                .0;
        }
    }

    pub fn check_gate(&self, user: &User, gate_name: &str) -> bool {
        self.get_feature_gate(user, gate_name).value
    }

    pub fn check_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: &EvaluationOptions,
    ) -> bool {
        self.get_feature_gate_with_options(user, gate_name, options)
            .value
    }

    pub fn get_feature_gate(&self, user: &User, gate_name: &str) -> FeatureGate {
        self.get_feature_gate_with_options(user, gate_name, &EvaluationOptions::default())
    }

    pub fn get_feature_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: &EvaluationOptions,
    ) -> FeatureGate {
        let user = self.inner.normalize_user(user);
        let result = self.inner.evaluate(&user, EntityKind::Gate, gate_name, options.sticky);
        if !options.disable_exposure_logging {
            self.inner.log_exposure(|| gate_exposure(&user, gate_name, &result));
        }
        FeatureGate::from_result(gate_name, result)
    }

    pub fn get_dynamic_config(&self, user: &User, config_name: &str) -> DynamicConfig {
        self.get_dynamic_config_with_options(user, config_name, &EvaluationOptions::default())
    }

    pub fn get_dynamic_config_with_options(
        &self,
        user: &User,
        config_name: &str,
        options: &EvaluationOptions,
    ) -> DynamicConfig {
        let user = self.inner.normalize_user(user);
        let result =
            self.inner
                .evaluate(&user, EntityKind::DynamicConfig, config_name, options.sticky);
        if !options.disable_exposure_logging {
            self.inner
                .log_exposure(|| config_exposure(&user, config_name, &result));
        }
        DynamicConfig::from_result(config_name, result)
    }

    pub fn get_experiment(&self, user: &User, experiment_name: &str) -> Experiment {
        self.get_experiment_with_options(user, experiment_name, &EvaluationOptions::default())
    }

    pub fn get_experiment_with_options(
        &self,
        user: &User,
        experiment_name: &str,
        options: &EvaluationOptions,
    ) -> Experiment {
        let user = self.inner.normalize_user(user);
        let result =
            self.inner
                .evaluate(&user, EntityKind::Experiment, experiment_name, options.sticky);
        if !options.disable_exposure_logging {
            self.inner
                .log_exposure(|| config_exposure(&user, experiment_name, &result));
        }
        Experiment::from_result(experiment_name, result)
    }

    /// Evaluate a layer. Exposures are logged per parameter, when read through [`Layer::get`].
    pub fn get_layer(&self, user: &User, layer_name: &str) -> Layer {
        self.get_layer_with_options(user, layer_name, &EvaluationOptions::default())
    }

    pub fn get_layer_with_options(
        &self,
        user: &User,
        layer_name: &str,
        options: &EvaluationOptions,
    ) -> Layer {
        let user = self.inner.normalize_user(user);
        let result = self
            .inner
            .evaluate(&user, EntityKind::Layer, layer_name, options.sticky);
        let logger = if options.disable_exposure_logging {
            None
        } else {
            self.inner.active_event_logger()
        };
        Layer::from_result(layer_name, result, &user, logger)
    }

    /// Bind the parameter store `store_name` to `user`. Parameters are resolved when read.
    pub fn get_parameter_store(&self, user: &User, store_name: &str) -> ParameterStore {
        self.get_parameter_store_with_options(user, store_name, &EvaluationOptions::default())
    }

    pub fn get_parameter_store_with_options(
        &self,
        user: &User,
        store_name: &str,
        options: &EvaluationOptions,
    ) -> ParameterStore {
        let snapshot = self.inner.store.current_snapshot();
        let exists = snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.values.parameter_stores.contains_key(store_name));
        let details = EvaluationDetails::for_snapshot(snapshot.as_deref(), |source| {
            if exists {
                EvaluationReason::Recognized(source)
            } else {
                EvaluationReason::Unrecognized(source)
            }
        });
        ParameterStore::new(
            store_name,
            details,
            self.inner.normalize_user(user).into_owned(),
            *options,
            Arc::downgrade(&self.inner),
        )
    }

    /// Evaluate everything for `user` so a client SDK can initialize without the rules. Records
    /// no exposures; clients log their own when values are used.
    pub fn get_client_initialize_response(&self, user: &User) -> ClientInitializeResponse {
        self.get_client_initialize_response_with_options(user, &ClientInitResponseOptions::default())
    }

    pub fn get_client_initialize_response_with_options(
        &self,
        user: &User,
        options: &ClientInitResponseOptions,
    ) -> ClientInitializeResponse {
        let user = self.inner.normalize_user(user);
        let snapshot = self.inner.store.current_snapshot();
        format_client_initialize_response(snapshot.as_deref(), &user, options, |kind, name| {
            self.inner
                .evaluate_against(snapshot.as_deref(), &user, kind, name, false)
        })
    }

    /// Queue a custom event. Does nothing after shutdown or when logging is disabled.
    pub fn log_event(
        &self,
        user: &User,
        event_name: &str,
        value: Option<Value>,
        metadata: Option<HashMap<String, String>>,
    ) {
        if let Some(logger) = self.inner.active_event_logger() {
            let user = self.inner.normalize_user(user);
            logger.enqueue(Event::custom(&user, event_name, value, metadata));
        }
    }

    /// Force an entity to `value`, for every user (`targeting_id: None`) or for the user or
    /// custom id equal to `targeting_id`.
    pub fn set_override(
        &self,
        kind: EntityKind,
        name: &str,
        targeting_id: Option<&str>,
        value: OverrideValue,
    ) -> Result<()> {
        self.inner
            .overrides
            .set_override(kind, name, targeting_id, value)
    }

    pub fn override_gate(&self, gate_name: &str, value: bool, targeting_id: Option<&str>) -> Result<()> {
        self.set_override(
            EntityKind::Gate,
            gate_name,
            targeting_id,
            OverrideValue::Gate(value),
        )
    }

    pub fn override_dynamic_config(
        &self,
        config_name: &str,
        value: Map<String, Value>,
        targeting_id: Option<&str>,
    ) -> Result<()> {
        self.set_override(
            EntityKind::DynamicConfig,
            config_name,
            targeting_id,
            OverrideValue::Config(value),
        )
    }

    /// Force users into `group_name` of an experiment. The group is looked up in the specs
    /// current at evaluation time.
    pub fn override_experiment_by_group_name(
        &self,
        experiment_name: &str,
        group_name: &str,
        targeting_id: Option<&str>,
    ) -> Result<()> {
        self.set_override(
            EntityKind::Experiment,
            experiment_name,
            targeting_id,
            OverrideValue::GroupName(group_name.to_owned()),
        )
    }

    /// Returns `true` if an override was removed.
    pub fn remove_override(&self, kind: EntityKind, name: &str, targeting_id: Option<&str>) -> bool {
        self.inner.overrides.remove_override(kind, name, targeting_id)
    }

    pub fn remove_all_overrides(&self) {
        self.inner.overrides.remove_all();
    }

    pub fn current_specs_info(&self) -> SpecsInfo {
        self.inner.store.current_specs_info()
    }

    /// Flush queued events, waiting up to `timeout` for the batch to be handed to the adapter.
    pub fn flush_events(&self, timeout: Duration) -> Result<()> {
        match &self.inner.event_logger {
            Some(logger) => logger.flush(timeout),
            None => Ok(()),
        }
    }

    /// Number of events waiting to be flushed.
    pub fn pending_events_count(&self) -> usize {
        self.inner
            .event_logger
            .as_ref()
            .map_or(0, |logger| logger.queued_len())
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_events_count(&self) -> u64 {
        self.inner
            .event_logger
            .as_ref()
            .map_or(0, |logger| logger.dropped_events_count())
    }

    /// Stop background syncing and drain the event queue. Later calls are no-ops.
    ///
    /// Evaluations keep working against the last snapshot but record no events.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock().map_err(|_| Error::ThreadPanicked)?;
            if matches!(*state, EngineState::ShuttingDown | EngineState::Shutdown) {
                return Ok(());
            }
            *state = EngineState::ShuttingDown;
        }

        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let mut first_error = None;

        let adapter = &self.inner.specs_adapter;
        if let Err(err) = catch_adapter_panic("specs adapter shutdown", || adapter.shutdown(remaining())) {
            log::warn!(target: "switchyard", "specs adapter failed to shut down: {err}");
            first_error = first_error.or(Some(err));
        }
        if let Some(syncer) = &self.inner.id_lists_syncer {
            if let Err(err) = syncer.shutdown(remaining()) {
                log::warn!(target: "switchyard", "id list sync failed to shut down: {err}");
                first_error = first_error.or(Some(err));
            }
        }
        if let Some(logger) = &self.inner.event_logger {
            if let Err(err) = logger.shutdown(remaining()) {
                log::warn!(target: "switchyard", "event logger failed to shut down: {err}");
                first_error = first_error.or(Some(err));
            }
        }

        self.inner.set_state(EngineState::Shutdown);
        log::debug!(target: "switchyard", "engine shut down");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !matches!(self.state(), EngineState::Shutdown) {
            let _ = self.shutdown(DROP_SHUTDOWN_TIMEOUT);
        }
    }
}

impl EngineInner {
    fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Shutdown)
    }

    fn set_state(&self, new_state: EngineState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
    }

    /// Start the adapter's polling unless shutdown has begun. Holding the state lock means a
    /// concurrent [`Engine::shutdown`] runs after the poller exists, and stops it.
    fn schedule_background_sync(&self) -> Result<()> {
        let state = self.state.lock().map_err(|_| Error::ThreadPanicked)?;
        if matches!(*state, EngineState::ShuttingDown | EngineState::Shutdown) {
            log::debug!(target: "switchyard", "engine shut down during initialization, skipping background sync");
            return Ok(());
        }
        let adapter = &self.specs_adapter;
        catch_adapter_panic("specs adapter schedule_background_sync", || {
            adapter.schedule_background_sync()
        })
    }

    /// Apply the configured environment to users that do not carry one.
    fn normalize_user<'u>(&self, user: &'u User) -> Cow<'u, User> {
        match &self.options.environment {
            Some(tier) if !user.statsig_environment.contains_key("tier") => {
                let mut user = user.clone();
                user.statsig_environment
                    .insert("tier".to_owned(), tier.clone());
                Cow::Owned(user)
            }
            _ => Cow::Borrowed(user),
        }
    }

    fn evaluate(&self, user: &User, kind: EntityKind, name: &str, sticky: bool) -> EvaluationResult {
        let snapshot = self.store.current_snapshot();
        self.evaluate_against(snapshot.as_deref(), user, kind, name, sticky)
    }

    fn evaluate_against(
        &self,
        snapshot: Option<&SpecsSnapshot>,
        user: &User,
        kind: EntityKind,
        name: &str,
        sticky: bool,
    ) -> EvaluationResult {
        let result = EvaluatorContext::new(user, snapshot, &self.overrides, &Sha256Sharder)
            .with_persistent_storage(self.persistent_storage.as_deref(), sticky)
            .evaluate(kind, name);
        log::trace!(target: "switchyard", entity = name, rule_id = result.rule_id.as_str(); "evaluated {kind}: {}", result.details.reason);
        result
    }

    /// Event logger, unless logging is disabled or the engine is shutting down.
    fn active_event_logger(&self) -> Option<&Arc<EventLogger>> {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Shutdown => None,
            _ => self.event_logger.as_ref(),
        }
    }

    fn log_exposure(&self, exposure: impl FnOnce() -> Exposure) {
        if let Some(logger) = self.active_event_logger() {
            logger.enqueue_exposure(exposure());
        }
    }

    /// Resolve one parameter of a parameter store against the current specs.
    pub(crate) fn get_parameter(
        &self,
        user: &User,
        store_name: &str,
        parameter_name: &str,
        options: &EvaluationOptions,
    ) -> Option<Value> {
        let snapshot = self.store.current_snapshot()?;
        let parameter = snapshot
            .values
            .parameter_stores
            .get(store_name)?
            .parameters
            .get(parameter_name)?;
        let parameter = Option::<&Parameter>::from(parameter)?;

        let layer_parameter = match parameter {
            Parameter::Layer { param_name, .. } => Some(param_name.as_str()),
            _ => None,
        };

        resolve_parameter(parameter, |kind, name| {
            let result = self.evaluate_against(Some(&*snapshot), user, kind, name, options.sticky);
            if !options.disable_exposure_logging {
                self.log_exposure(|| match (kind, layer_parameter) {
                    (EntityKind::Gate, _) => gate_exposure(user, name, &result),
                    (EntityKind::Layer, Some(param)) => layer_exposure(user, name, param, &result),
                    _ => config_exposure(user, name, &result),
                });
            }
            result
        })
    }
}

fn select_specs_adapter(sdk_key: &str, options: &EngineOptions) -> Result<Arc<dyn SpecsAdapter>> {
    if let Some(adapter) = &options.specs_adapter {
        return Ok(adapter.clone());
    }
    if let Some(data_store) = &options.data_store {
        return Ok(Arc::new(DataStoreSpecsAdapter::new(
            sdk_key,
            data_store.clone(),
            options.specs_sync_interval(),
        )));
    }
    if options.disable_network {
        return Ok(Arc::new(NoopSpecsAdapter));
    }
    Ok(Arc::new(HttpSpecsAdapter::new(sdk_key, options)?))
}

fn select_event_logging_adapter(
    sdk_key: &str,
    options: &EngineOptions,
) -> Result<Arc<dyn EventLoggingAdapter>> {
    if let Some(adapter) = &options.event_logging_adapter {
        return Ok(adapter.clone());
    }
    if options.disable_network {
        return Ok(Arc::new(NoopEventLoggingAdapter));
    }
    Ok(Arc::new(HttpEventLoggingAdapter::new(sdk_key, options)?))
}
