use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::json;
use switchyard::{
    ClientInitResponseOptions, Engine, EngineOptions, EngineState, EntityKind, Error, EvaluationOptions, EvaluationReason,
    FunctionEventLoggingAdapter, HashAlgorithm, InMemoryPersistentStorage, LocalFileSpecsAdapter,
    LogEventRequest, OverrideValue, Result, SpecsAdapter, SpecsSource, SpecsUpdate,
    SpecsUpdateListener, User,
};

const SPECS_PATH: &str = "tests/data/specs.json";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn specs_fixture() -> String {
    std::fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join(SPECS_PATH)).unwrap()
}

/// Pushes payloads as if they were downloaded from the network.
struct ScriptedSpecsAdapter {
    initial: String,
    listener: Mutex<Option<Arc<dyn SpecsUpdateListener>>>,
}

impl ScriptedSpecsAdapter {
    fn new(initial: String) -> Arc<ScriptedSpecsAdapter> {
        Arc::new(ScriptedSpecsAdapter {
            initial,
            listener: Mutex::new(None),
        })
    }

    fn push(&self, data: String) -> Result<()> {
        let listener = self.listener.lock().unwrap().clone().unwrap();
        listener.did_receive_specs_update(SpecsUpdate {
            data,
            source: SpecsSource::Network,
            received_at: 1,
        })
    }
}

impl SpecsAdapter for ScriptedSpecsAdapter {
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        *self.listener.lock().unwrap() = Some(listener.clone());
        listener.did_receive_specs_update(SpecsUpdate {
            data: self.initial.clone(),
            source: SpecsSource::Network,
            received_at: 1,
        })
    }

    fn schedule_background_sync(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn type_name(&self) -> String {
        "ScriptedSpecsAdapter".to_owned()
    }
}

/// Records calls, with a slow or failing first sync.
struct CountingSpecsAdapter {
    start_delay: Duration,
    start_result: Result<()>,
    schedule_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

impl CountingSpecsAdapter {
    fn new(start_delay: Duration, start_result: Result<()>) -> Arc<CountingSpecsAdapter> {
        Arc::new(CountingSpecsAdapter {
            start_delay,
            start_result,
            schedule_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        })
    }
}

impl SpecsAdapter for CountingSpecsAdapter {
    fn start(&self, _listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        std::thread::sleep(self.start_delay);
        self.start_result.clone()
    }

    fn schedule_background_sync(&self) -> Result<()> {
        self.schedule_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn type_name(&self) -> String {
        "CountingSpecsAdapter".to_owned()
    }
}

fn engine_with(options: EngineOptions) -> (Engine, Arc<ScriptedSpecsAdapter>) {
    init();
    let adapter = ScriptedSpecsAdapter::new(specs_fixture());
    let engine = Engine::new(
        "secret-key",
        options
            .with_disable_network(true)
            .with_specs_adapter(adapter.clone()),
    )
    .unwrap();
    engine.initialize_blocking().unwrap();
    (engine, adapter)
}

fn updated_specs(lcut: u64, pass_percentage: u32) -> String {
    let mut specs: serde_json::Value = serde_json::from_str(&specs_fixture()).unwrap();
    specs["time"] = json!(lcut);
    specs["dynamic_configs"]["button_color"]["rules"][0]["passPercentage"] = json!(pass_percentage);
    specs.to_string()
}

#[test]
fn public_gate_passes() {
    let (engine, _) = engine_with(EngineOptions::default());

    let gate = engine.get_feature_gate(&User::with_user_id("u1"), "beta");
    assert!(gate.value);
    assert_eq!(gate.rule_id, "public_rule");
    assert_eq!(gate.details.reason.to_string(), "Network:Recognized");
    assert_eq!(gate.details.lcut, Some(5));
}

#[test]
fn missing_gate_is_unrecognized() {
    let (engine, _) = engine_with(EngineOptions::default());

    let gate = engine.get_feature_gate(&User::with_user_id("u1"), "does_not_exist");
    assert!(!gate.value);
    assert_eq!(
        gate.details.reason,
        EvaluationReason::Unrecognized(SpecsSource::Network)
    );
}

#[test]
fn stale_update_is_rejected() {
    let (engine, adapter) = engine_with(EngineOptions::default());
    assert_eq!(engine.current_specs_info().lcut, Some(5));

    let result = adapter.push(updated_specs(3, 100));
    assert!(matches!(
        result,
        Err(Error::StaleUpdate {
            current_lcut: 5,
            incoming_lcut: 3
        })
    ));
    assert_eq!(engine.current_specs_info().lcut, Some(5));

    adapter.push(updated_specs(6, 100)).unwrap();
    assert_eq!(engine.current_specs_info().lcut, Some(6));
}

#[test]
fn partial_rollout_is_deterministic() {
    let (first, _) = engine_with(EngineOptions::default());
    let (second, _) = engine_with(EngineOptions::default());

    let passing: Vec<String> = (1..=10)
        .map(|i| format!("u{i}"))
        .filter(|id| first.check_gate(&User::with_user_id(id.as_str()), "half_rollout"))
        .collect();
    assert_eq!(passing, ["u2", "u5", "u7", "u8"]);

    for i in 1..=10 {
        let user = User::with_user_id(format!("u{i}"));
        for _ in 0..10 {
            assert_eq!(
                first.check_gate(&user, "half_rollout"),
                second.check_gate(&user, "half_rollout")
            );
        }
    }
}

#[test]
fn nested_gates_drive_configs() {
    let (engine, _) = engine_with(EngineOptions::default());

    let mut employee = User::with_user_id("u1");
    employee.email = Some("jane@example.com".to_owned());
    let config = engine.get_dynamic_config(&employee, "checkout");
    assert_eq!(config.rule_id, "employees_config");
    assert_eq!(config.get::<String>("currency").as_deref(), Some("EUR"));

    let config = engine.get_dynamic_config(&User::with_user_id("u2"), "checkout");
    assert_eq!(config.rule_id, "default");
    assert_eq!(config.get::<i64>("steps"), Some(3));
}

#[test]
fn override_beats_rules() {
    let (engine, _) = engine_with(EngineOptions::default());
    let u1 = User::with_user_id("u1");
    let u2 = User::with_user_id("u2");

    engine
        .set_override(EntityKind::Gate, "beta", Some("u1"), OverrideValue::Gate(false))
        .unwrap();
    let gate = engine.get_feature_gate(&u1, "beta");
    assert!(!gate.value);
    assert_eq!(gate.details.reason, EvaluationReason::LocalOverride);
    assert!(engine.check_gate(&u2, "beta"));

    engine
        .override_experiment_by_group_name("button_color", "Test", None)
        .unwrap();
    let experiment = engine.get_experiment(&u2, "button_color");
    assert_eq!(experiment.group_name.as_deref(), Some("Test"));
    assert_eq!(experiment.details.reason, EvaluationReason::LocalOverride);

    assert!(matches!(
        engine.set_override(EntityKind::DynamicConfig, "checkout", None, OverrideValue::Gate(true)),
        Err(Error::InvalidOverride(_))
    ));
}

#[test]
fn sticky_assignment_survives_spec_update() {
    let storage = Arc::new(InMemoryPersistentStorage::new());
    let (engine, adapter) =
        engine_with(EngineOptions::default().with_persistent_storage(storage.clone()));
    let sticky = EvaluationOptions::sticky();
    let u1 = User::with_user_id("u1");

    let experiment = engine.get_experiment_with_options(&u1, "button_color", &sticky);
    assert_eq!(experiment.get::<String>("color").as_deref(), Some("red"));
    assert_eq!(experiment.group_name.as_deref(), Some("Test"));

    // Nobody passes the rule after the update, but u1 keeps their assignment.
    adapter.push(updated_specs(6, 0)).unwrap();

    let experiment = engine.get_experiment_with_options(&u1, "button_color", &sticky);
    assert_eq!(experiment.get::<String>("color").as_deref(), Some("red"));
    assert_eq!(experiment.details.reason, EvaluationReason::Persisted);

    let fresh = engine.get_experiment_with_options(&User::with_user_id("u2"), "button_color", &sticky);
    assert_eq!(fresh.get::<String>("color").as_deref(), Some("grey"));

    let unsticky = engine.get_experiment(&u1, "button_color");
    assert_eq!(unsticky.get::<String>("color").as_deref(), Some("grey"));
}

#[test]
fn event_queue_stays_bounded() {
    let delivered = Arc::new(Mutex::new(0usize));
    let adapter = {
        let delivered = delivered.clone();
        move |request: &LogEventRequest| -> Result<()> {
            *delivered.lock().unwrap() += request.events.len();
            Ok(())
        }
    };
    let (engine, _) = engine_with(
        EngineOptions::default()
            .with_event_logging_max_queue_size(10_000)
            .with_event_logging_flush_interval(Duration::from_secs(3600))
            .with_event_logging_adapter(Arc::new(adapter)),
    );

    let user = User::with_user_id("u1");
    for i in 0..10_001 {
        engine.log_event(&user, "click", Some(json!(i)), None);
        assert!(engine.pending_events_count() <= 10_000);
    }
    engine.flush_events(Duration::from_secs(10)).unwrap();

    let delivered = *delivered.lock().unwrap() as u64;
    assert_eq!(delivered + engine.dropped_events_count(), 10_001);
}

#[test]
fn shutdown_delivers_exposures_and_custom_events() {
    let batches = Arc::new(Mutex::new(Vec::<LogEventRequest>::new()));
    let adapter = {
        let batches = batches.clone();
        FunctionEventLoggingAdapter::new(move |request| {
            batches.lock().unwrap().push(request.clone());
            Ok(())
        })
    };
    let (engine, _) = engine_with(EngineOptions::default().with_event_logging_adapter(Arc::new(adapter)));

    let user = User::with_user_id("u1").private_attribute("ssn", "123");
    engine.check_gate(&user, "beta");
    engine.log_event(&user, "purchase", Some(json!(12.5)), None);
    engine.shutdown(Duration::from_secs(5)).unwrap();

    let batches = batches.lock().unwrap();
    let events: Vec<_> = batches.iter().flat_map(|batch| batch.events.iter()).collect();
    let names: Vec<_> = events.iter().map(|event| event.event_name.as_str()).collect();
    assert_eq!(names, ["statsig::gate_exposure", "purchase"]);

    let json = serde_json::to_value(&batches[0]).unwrap();
    assert!(json["events"][0]["user"].get("privateAttributes").is_none());
    assert_eq!(json["statsigMetadata"]["sdkType"], "switchyard-rust");
}

#[test]
fn layer_exposures_are_logged_per_parameter() {
    let specs = json!({
        "time": 1,
        "dynamic_configs": {"exp": {
            "type": "dynamic_config", "entity": "experiment", "salt": "e", "enabled": true,
            "isActive": true, "defaultValue": {}, "explicitParameters": ["title"],
            "rules": [{"id": "treatment", "groupName": "Treatment", "passPercentage": 100,
                       "returnValue": {"title": "New"}, "conditions": [{"type": "public"}]}]
        }},
        "layer_configs": {"home": {
            "type": "dynamic_config", "entity": "layer", "salt": "l", "enabled": true,
            "defaultValue": {"title": "Old", "theme": "light"},
            "rules": [{"id": "alloc", "passPercentage": 100, "configDelegate": "exp",
                       "returnValue": {}, "conditions": [{"type": "public"}]}]
        }}
    });
    let batches = Arc::new(Mutex::new(Vec::<LogEventRequest>::new()));
    let adapter = {
        let batches = batches.clone();
        move |request: &LogEventRequest| -> Result<()> {
            batches.lock().unwrap().push(request.clone());
            Ok(())
        }
    };
    let engine = Engine::new(
        "secret-key",
        EngineOptions::default()
            .with_disable_network(true)
            .with_bootstrap_specs(specs.to_string())
            .with_event_logging_adapter(Arc::new(adapter)),
    )
    .unwrap();
    engine.initialize().unwrap();

    let layer = engine.get_layer(&User::with_user_id("u1"), "home");
    assert_eq!(layer.allocated_experiment_name.as_deref(), Some("exp"));
    assert_eq!(engine.pending_events_count(), 0);

    assert_eq!(layer.get_as::<String>("title").as_deref(), Some("New"));
    assert_eq!(layer.get_as::<String>("theme").as_deref(), Some("light"));
    assert!(layer.get("missing").is_none());
    assert_eq!(engine.pending_events_count(), 2);

    engine.flush_events(Duration::from_secs(5)).unwrap();
    let batches = batches.lock().unwrap();
    let metadata = batches[0].events[0].metadata.as_ref().unwrap();
    assert_eq!(metadata["allocatedExperiment"], "exp");
    assert_eq!(metadata["parameterName"], "title");
}

#[test]
fn local_file_adapter_reads_snapshot() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specs.json");
    std::fs::write(&path, specs_fixture()).unwrap();

    let engine = Engine::new(
        "secret-key",
        EngineOptions::default()
            .with_disable_network(true)
            .with_specs_adapter(Arc::new(LocalFileSpecsAdapter::new(&path))),
    )
    .unwrap();
    engine.initialize_blocking().unwrap();

    let gate = engine.get_feature_gate(&User::with_user_id("u1"), "beta");
    assert!(gate.value);
    assert_eq!(gate.details.reason.to_string(), "Cache:Recognized");
}

#[test]
fn options_from_json_build_an_engine() {
    init();
    let options = EngineOptions::from_json(
        r#"{"disableNetwork": true, "event_logging_max_queue_size": 5, "initTimeoutMs": 100}"#,
    )
    .unwrap();
    let engine = Engine::new("secret-key", options).unwrap();
    engine.initialize_blocking().unwrap();

    let user = User::with_user_id("u1");
    for i in 0..20 {
        engine.log_event(&user, &format!("event_{i}"), None, None);
        assert!(engine.pending_events_count() <= 5);
    }
    assert_eq!(
        engine.get_feature_gate(&user, "beta").details.reason,
        EvaluationReason::Uninitialized
    );
}

#[test]
fn polling_continues_after_failed_first_sync() {
    init();
    let adapter = CountingSpecsAdapter::new(Duration::ZERO, Err(Error::UnexpectedStatus(503)));
    let engine = Engine::new(
        "secret-key",
        EngineOptions::default()
            .with_disable_network(true)
            .with_specs_adapter(adapter.clone()),
    )
    .unwrap();

    assert!(matches!(
        engine.initialize_blocking(),
        Err(Error::UnexpectedStatus(503))
    ));
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(adapter.schedule_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_during_first_sync_leaves_no_background_sync() {
    init();
    let adapter = CountingSpecsAdapter::new(Duration::from_millis(200), Ok(()));
    let engine = Engine::new(
        "secret-key",
        EngineOptions::default()
            .with_disable_network(true)
            .with_specs_adapter(adapter.clone()),
    )
    .unwrap();

    engine.initialize().unwrap();
    engine.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(engine.state(), EngineState::Shutdown);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(adapter.schedule_calls.load(Ordering::SeqCst), 0);
    assert_eq!(adapter.shutdown_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn client_initialize_response_carries_hashed_evaluations() {
    let (engine, _) = engine_with(EngineOptions::default());
    let mut employee = User::with_user_id("u1").private_attribute("ssn", "123");
    employee.email = Some("jane@example.com".to_owned());

    let response = engine.get_client_initialize_response(&employee);
    assert_eq!(response.time, 5);
    assert!(response.has_updates);
    assert_eq!(response.feature_gates.len(), 3);

    let beta = &response.feature_gates["9E5k5185SOn3P436lHIcTOjLtPJlxHkMcCstQc+/J1M="];
    assert!(beta.value);
    assert_eq!(beta.rule_id, "public_rule");

    let checkout = &response.dynamic_configs["x3YeWJafft1JgYZkGyAh6Ed+G80jDeTPNDUkLaSkDRQ="];
    assert_eq!(checkout.value["currency"], "EUR");
    assert_eq!(checkout.passed, Some(true));
    assert_eq!(
        checkout.secondary_exposures[0].gate,
        "xJ3j0mX7HZfQ/BBLvFRBH/N4S7G+SMXOOk8xp28iNGk="
    );

    let button = &response.dynamic_configs["yNcHJ/sxIZLMvZrrkk//jo4jAPbJAAxNko8SqL00bT0="];
    assert_eq!(button.group_name.as_deref(), Some("Test"));
    assert_eq!(button.is_user_in_experiment, Some(true));
    assert_eq!(button.passed, None);

    // Building the response is not an exposure.
    assert_eq!(engine.pending_events_count(), 0);

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["hash_used"], "sha256");
    assert_eq!(json["evaluated_keys"]["userID"], "u1");
    assert!(json["user"].get("privateAttributes").is_none());

    let options = ClientInitResponseOptions::default()
        .with_hash_algorithm(HashAlgorithm::None)
        .with_feature_gate_filter(["beta"]);
    let plain = engine.get_client_initialize_response_with_options(&employee, &options);
    assert_eq!(plain.feature_gates.keys().collect::<Vec<_>>(), ["beta"]);
    assert!(plain.dynamic_configs.contains_key("checkout"));
}

#[test]
fn client_initialize_response_before_specs_is_empty() {
    init();
    let engine = Engine::new("secret-key", EngineOptions::default().with_disable_network(true)).unwrap();

    let response = engine.get_client_initialize_response(&User::with_user_id("u1"));
    assert!(!response.has_updates);
    assert_eq!(response.time, 0);
    assert!(response.feature_gates.is_empty());
}
