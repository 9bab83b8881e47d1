//! Analytics events: exposures recorded by evaluations and custom events logged by the host.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    eval::{EvaluationDetails, EvaluationResult, SecondaryExposure},
    unix_time_millis, SdkMetadata, User,
};

mod adapters;
mod dedupe;
mod logger;

pub use adapters::{
    EventLoggingAdapter, FunctionEventLoggingAdapter, HttpEventLoggingAdapter,
    LocalFileEventLoggingAdapter, NoopEventLoggingAdapter, DEFAULT_LOG_EVENT_URL,
};
pub use logger::EventLogger;

pub const GATE_EXPOSURE_EVENT: &str = "statsig::gate_exposure";
pub const CONFIG_EXPOSURE_EVENT: &str = "statsig::config_exposure";
pub const LAYER_EXPOSURE_EVENT: &str = "statsig::layer_exposure";

/// A single analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_name: String,
    /// Private attributes are never serialized.
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    /// Milliseconds since epoch.
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_exposures: Option<Vec<SecondaryExposure>>,
}

impl Event {
    /// A custom event, as logged by the host through [`Engine::log_event`](crate::Engine::log_event).
    pub fn custom(
        user: &User,
        event_name: impl Into<String>,
        value: Option<Value>,
        metadata: Option<HashMap<String, String>>,
    ) -> Event {
        Event {
            event_name: event_name.into(),
            user: user.clone(),
            value,
            metadata,
            time: unix_time_millis(),
            secondary_exposures: None,
        }
    }
}

/// Batch handed to an [`EventLoggingAdapter`] on flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventRequest {
    pub events: Vec<Event>,
    pub statsig_metadata: SdkMetadata,
}

/// An exposure event together with the key it is de-duplicated by.
pub(crate) struct Exposure {
    pub key: String,
    pub event: Event,
}

fn details_metadata(details: &EvaluationDetails) -> HashMap<String, String> {
    let mut metadata = HashMap::from([("reason".to_owned(), details.reason.to_string())]);
    if let Some(lcut) = details.lcut {
        metadata.insert("lcut".to_owned(), lcut.to_string());
    }
    if let Some(received_at) = details.received_at {
        metadata.insert("receivedAt".to_owned(), received_at.to_string());
    }
    metadata
}

/// `name|rule|value|ids` where ids are the user id and custom ids in a stable order.
fn exposure_key(user: &User, name: &str, rule_id: &str, extra: &[&str]) -> String {
    let mut custom_ids: Vec<_> = user.custom_ids.iter().collect();
    custom_ids.sort();

    let mut key = format!("{name}|{rule_id}|{}", user.user_id.as_deref().unwrap_or(""));
    for (id_type, id) in custom_ids {
        key.push_str(&format!("|{id_type}:{id}"));
    }
    for part in extra {
        key.push('|');
        key.push_str(part);
    }
    key
}

fn exposure_event(
    user: &User,
    event_name: &str,
    metadata: HashMap<String, String>,
    secondary_exposures: Vec<SecondaryExposure>,
) -> Event {
    Event {
        event_name: event_name.to_owned(),
        user: user.clone(),
        value: None,
        metadata: Some(metadata),
        time: unix_time_millis(),
        secondary_exposures: Some(secondary_exposures),
    }
}

pub(crate) fn gate_exposure(user: &User, gate: &str, result: &EvaluationResult) -> Exposure {
    let gate_value = result.bool_value.to_string();
    let mut metadata = details_metadata(&result.details);
    metadata.insert("gate".to_owned(), gate.to_owned());
    metadata.insert("gateValue".to_owned(), gate_value.clone());
    metadata.insert("ruleID".to_owned(), result.rule_id.clone());
    if let Some(version) = result.version {
        metadata.insert("configVersion".to_owned(), version.to_string());
    }

    Exposure {
        key: exposure_key(user, gate, &result.rule_id, &[&gate_value]),
        event: exposure_event(
            user,
            GATE_EXPOSURE_EVENT,
            metadata,
            result.secondary_exposures.clone(),
        ),
    }
}

/// Exposure of a dynamic config or an experiment.
pub(crate) fn config_exposure(user: &User, config: &str, result: &EvaluationResult) -> Exposure {
    let mut metadata = details_metadata(&result.details);
    metadata.insert("config".to_owned(), config.to_owned());
    metadata.insert("ruleID".to_owned(), result.rule_id.clone());
    metadata.insert("rulePassed".to_owned(), result.bool_value.to_string());
    if let Some(version) = result.version {
        metadata.insert("configVersion".to_owned(), version.to_string());
    }

    Exposure {
        key: exposure_key(user, config, &result.rule_id, &[]),
        event: exposure_event(
            user,
            CONFIG_EXPOSURE_EVENT,
            metadata,
            result.secondary_exposures.clone(),
        ),
    }
}

/// Exposure of a single layer parameter. Only explicit parameters of the allocated experiment
/// attribute the exposure to that experiment.
pub(crate) fn layer_exposure(
    user: &User,
    layer: &str,
    parameter: &str,
    result: &EvaluationResult,
) -> Exposure {
    let is_explicit = result.explicit_parameters.iter().any(|p| p == parameter);
    let (allocated_experiment, secondary_exposures) = if is_explicit {
        (
            result.config_delegate.clone().unwrap_or_default(),
            result.secondary_exposures.clone(),
        )
    } else {
        (
            String::new(),
            result
                .undelegated_secondary_exposures
                .clone()
                .unwrap_or_else(|| result.secondary_exposures.clone()),
        )
    };

    let mut metadata = details_metadata(&result.details);
    metadata.insert("config".to_owned(), layer.to_owned());
    metadata.insert("ruleID".to_owned(), result.rule_id.clone());
    metadata.insert("allocatedExperiment".to_owned(), allocated_experiment.clone());
    metadata.insert("parameterName".to_owned(), parameter.to_owned());
    metadata.insert("isExplicitParameter".to_owned(), is_explicit.to_string());
    if let Some(version) = result.version {
        metadata.insert("configVersion".to_owned(), version.to_string());
    }

    Exposure {
        key: exposure_key(
            user,
            layer,
            &result.rule_id,
            &[&allocated_experiment, parameter, &is_explicit.to_string()],
        ),
        event: exposure_event(user, LAYER_EXPOSURE_EVENT, metadata, secondary_exposures),
    }
}
