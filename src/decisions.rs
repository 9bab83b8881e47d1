//! Typed results returned by [`Engine`](crate::Engine) evaluations.
use std::{
    fmt,
    sync::{Arc, Weak},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{
    engine::{EngineInner, EvaluationOptions},
    eval::{EvaluationDetails, EvaluationResult},
    events::{layer_exposure, EventLogger},
    User,
};

/// Result of checking a feature gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGate {
    pub name: String,
    pub value: bool,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl FeatureGate {
    pub(crate) fn from_result(name: &str, result: EvaluationResult) -> FeatureGate {
        FeatureGate {
            name: name.to_owned(),
            value: result.bool_value,
            rule_id: result.rule_id,
            id_type: result.id_type,
            details: result.details,
        }
    }
}

/// Result of evaluating a dynamic config.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    pub name: String,
    pub value: Map<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl DynamicConfig {
    pub(crate) fn from_result(name: &str, result: EvaluationResult) -> DynamicConfig {
        DynamicConfig {
            name: name.to_owned(),
            value: result.json_value,
            rule_id: result.rule_id,
            id_type: result.id_type,
            details: result.details,
        }
    }

    /// Get `key` converted to `T`. Returns `None` when the key is missing or has another type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        get_typed(&self.value, key)
    }
}

/// Result of evaluating an experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub name: String,
    pub value: Map<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    /// Name of the group the user was assigned to, if any.
    pub group_name: Option<String>,
    pub is_experiment_active: bool,
    pub details: EvaluationDetails,
}

impl Experiment {
    pub(crate) fn from_result(name: &str, result: EvaluationResult) -> Experiment {
        Experiment {
            name: name.to_owned(),
            value: result.json_value,
            rule_id: result.rule_id,
            id_type: result.id_type,
            group_name: result.group_name,
            is_experiment_active: result.is_experiment_active,
            details: result.details,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        get_typed(&self.value, key)
    }
}

/// Records a layer exposure when a parameter is read.
#[derive(Debug, Clone)]
struct LayerExposureSink {
    logger: Weak<EventLogger>,
    user: User,
    result: Arc<EvaluationResult>,
}

/// Result of evaluating a layer.
///
/// Reading a parameter with [`Layer::get`] logs an exposure for that parameter. Reading
/// [`Layer::value`] directly does not.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub name: String,
    pub value: Map<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    /// Experiment the layer allocated the user to.
    pub allocated_experiment_name: Option<String>,
    pub is_experiment_active: bool,
    pub details: EvaluationDetails,
    #[serde(skip)]
    exposure_sink: Option<LayerExposureSink>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("rule_id", &self.rule_id)
            .field("group_name", &self.group_name)
            .field("allocated_experiment_name", &self.allocated_experiment_name)
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Layer) -> bool {
        self.name == other.name
            && self.value == other.value
            && self.rule_id == other.rule_id
            && self.id_type == other.id_type
            && self.group_name == other.group_name
            && self.allocated_experiment_name == other.allocated_experiment_name
            && self.is_experiment_active == other.is_experiment_active
            && self.details == other.details
    }
}

impl Layer {
    pub(crate) fn from_result(
        name: &str,
        result: EvaluationResult,
        user: &User,
        logger: Option<&Arc<EventLogger>>,
    ) -> Layer {
        let result = Arc::new(result);
        Layer {
            name: name.to_owned(),
            value: result.json_value.clone(),
            rule_id: result.rule_id.clone(),
            id_type: result.id_type.clone(),
            group_name: result.group_name.clone(),
            allocated_experiment_name: result.config_delegate.clone(),
            is_experiment_active: result.is_experiment_active,
            details: result.details.clone(),
            exposure_sink: logger.map(|logger| LayerExposureSink {
                logger: Arc::downgrade(logger),
                user: user.clone(),
                result,
            }),
        }
    }

    /// Read `parameter`, logging a layer exposure if it exists.
    pub fn get(&self, parameter: &str) -> Option<&Value> {
        let value = self.value.get(parameter)?;
        if let Some(sink) = &self.exposure_sink {
            if let Some(logger) = sink.logger.upgrade() {
                logger.enqueue_exposure(layer_exposure(
                    &sink.user,
                    &self.name,
                    parameter,
                    &sink.result,
                ));
            }
        }
        Some(value)
    }

    /// Like [`Layer::get`], converting the value to `T`.
    pub fn get_as<T: DeserializeOwned>(&self, parameter: &str) -> Option<T> {
        self.get(parameter)
            .and_then(|value| T::deserialize(value).ok())
    }
}

/// A parameter store bound to a user. Parameters are resolved lazily on [`ParameterStore::get`],
/// against the specs current at that time.
#[derive(Clone)]
pub struct ParameterStore {
    pub name: String,
    pub details: EvaluationDetails,
    user: User,
    options: EvaluationOptions,
    engine: Weak<EngineInner>,
}

impl fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterStore")
            .field("name", &self.name)
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

impl ParameterStore {
    pub(crate) fn new(
        name: &str,
        details: EvaluationDetails,
        user: User,
        options: EvaluationOptions,
        engine: Weak<EngineInner>,
    ) -> ParameterStore {
        ParameterStore {
            name: name.to_owned(),
            details,
            user,
            options,
            engine,
        }
    }

    /// Resolve `parameter`. Returns `None` when the store or parameter is unknown, or the engine
    /// has been dropped.
    pub fn get(&self, parameter: &str) -> Option<Value> {
        let engine = self.engine.upgrade()?;
        engine.get_parameter(&self.user, &self.name, parameter, &self.options)
    }

    /// Resolve `parameter` as `T`, falling back to `default`.
    pub fn get_or<T: DeserializeOwned>(&self, parameter: &str, default: T) -> T {
        self.get(parameter)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(default)
    }
}

fn get_typed<T: DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Option<T> {
    let value = map.get(key)?;
    match T::deserialize(value) {
        Ok(value) => Some(value),
        Err(err) => {
            log::debug!(target: "switchyard", key; "value has unexpected type: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::eval::EvaluationDetails;

    use super::{get_typed, DynamicConfig};

    fn config(value: Value) -> DynamicConfig {
        let Value::Object(value) = value else {
            panic!("expected object");
        };
        DynamicConfig {
            name: "config".to_owned(),
            value,
            rule_id: "rule".to_owned(),
            id_type: "userID".to_owned(),
            details: EvaluationDetails::uninitialized(),
        }
    }

    #[test]
    fn typed_getters() {
        let config = config(json!({"count": 3, "title": "hello", "tags": ["a", "b"]}));
        assert_eq!(config.get::<i64>("count"), Some(3));
        assert_eq!(config.get::<String>("title").as_deref(), Some("hello"));
        assert_eq!(config.get::<Vec<String>>("tags"), Some(vec!["a".to_owned(), "b".to_owned()]));
        assert_eq!(config.get::<i64>("title"), None);
        assert_eq!(config.get::<i64>("missing"), None);
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_value(config(json!({}))).unwrap();
        assert_eq!(json["ruleID"], "rule");
        assert_eq!(json["idType"], "userID");
        assert_eq!(json["details"]["reason"], "Uninitialized");
        assert_eq!(get_typed::<bool>(&Map::new(), "x"), None);
    }
}
