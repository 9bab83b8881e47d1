//! An embeddable feature gate and experimentation decision engine.
//!
//! # Overview
//!
//! The crate revolves around an [`Engine`] that evaluates feature gates, dynamic configs,
//! experiments, layers and parameter stores for a [`User`]. Rules are authored remotely and
//! synchronized into the engine by a [`SpecsAdapter`]; evaluation itself is local, deterministic
//! and never blocks on I/O.
//!
//! Evaluations record exposure events which are batched by the [`EventLogger`] and delivered
//! through an [`EventLoggingAdapter`].
//!
//! ```no_run
//! # use switchyard::{Engine, EngineOptions, User};
//! let engine = Engine::new("secret-key", EngineOptions::default())?;
//! engine.initialize_blocking()?;
//!
//! let user = User::with_user_id("user-1").custom_attribute("plan", "pro");
//! let experiment = engine.get_experiment(&user, "checkout_flow");
//! let button_color = experiment.get::<String>("button_color");
//! # Ok::<(), switchyard::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never returns errors. Problems such as missing specs or unsupported conditions are
//! reported through [`EvaluationDetails::reason`] and the zero value is returned. Errors are only
//! returned when constructing an engine with invalid options and from blocking calls that time
//! out.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with the `switchyard`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into sync and flush activity.

#![warn(rustdoc::missing_crate_level_docs)]

mod client_init;
mod decisions;
mod engine;
mod error;
mod eval;
mod events;
mod id_lists;
mod metadata;
mod options;
mod overrides;
mod persistent_storage;
mod poller;
mod registry;
mod sharder;
mod spec_store;
mod specs;
mod specs_adapter;
mod user;

pub use client_init::{
    ClientInitResponseOptions, ClientInitializeResponse, ConfigEvaluation, EvaluatedKeys,
    GateEvaluation, HashAlgorithm, LayerEvaluation,
};
pub use decisions::{DynamicConfig, Experiment, FeatureGate, Layer, ParameterStore};
pub use engine::{Engine, EngineState, EvaluationOptions};
pub use error::{Error, Result};
pub use eval::{EntityKind, EvaluationDetails, EvaluationReason, SecondaryExposure};
pub use events::{
    Event, EventLogger, EventLoggingAdapter, FunctionEventLoggingAdapter,
    HttpEventLoggingAdapter, LocalFileEventLoggingAdapter, LogEventRequest,
    NoopEventLoggingAdapter, DEFAULT_LOG_EVENT_URL,
};
pub use id_lists::{IdList, IdListMetadata, DEFAULT_ID_LISTS_URL};
pub use metadata::SdkMetadata;
pub use options::{EngineOptions, ProxyConfig};
pub use overrides::{OverrideStore, OverrideValue};
pub use persistent_storage::{
    InMemoryPersistentStorage, PersistentStorage, StickyValues, UserPersistedValues,
};
pub use registry::{EngineRegistry, INVALID_HANDLE};
pub use spec_store::{SpecStore, SpecsInfo, SpecsSnapshot, SpecsSource, SpecsUpdate, SpecsUpdateListener};
pub use specs::SpecsResponse;
pub use specs_adapter::{
    DataStore, DataStoreSpecsAdapter, FunctionSpecsAdapter, HttpSpecsAdapter,
    LocalFileSpecsAdapter, NoopSpecsAdapter, SpecsAdapter, SpecsPushHandle, DEFAULT_SPECS_URL,
};
pub use user::{AttributeValue, Attributes, User};

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn unix_time_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
