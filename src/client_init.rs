//! Evaluations precomputed for a client SDK, which then decides locally without ever seeing the
//! rules.
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    eval::{EntityKind, EvaluationResult, SecondaryExposure},
    metadata::{SDK_TYPE, SDK_VERSION},
    spec_store::SpecsSnapshot,
    specs::{Spec, TryParse},
    User,
};

/// How entity names are obscured in a [`ClientInitializeResponse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Base64 encoded SHA-256 digest.
    #[default]
    Sha256,
    /// 32-bit djb2 hash as a decimal string.
    Djb2,
    /// Names are sent as is.
    None,
}

impl HashAlgorithm {
    pub fn hash_name(&self, name: &str) -> String {
        match self {
            HashAlgorithm::Sha256 => STANDARD.encode(Sha256::digest(name.as_bytes())),
            HashAlgorithm::Djb2 => djb2(name),
            HashAlgorithm::None => name.to_owned(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Djb2 => "djb2",
            HashAlgorithm::None => "none",
        })
    }
}

fn djb2(input: &str) -> String {
    let mut hash: i32 = 0;
    for c in input.chars() {
        hash = (hash << 5).wrapping_sub(hash).wrapping_add(c as i32);
    }
    (hash as u32).to_string()
}

/// Selects and shapes what goes into a [`ClientInitializeResponse`].
///
/// A filter, when set, keeps only the named entities of its kind.
#[derive(Debug, Clone, Default)]
pub struct ClientInitResponseOptions {
    pub hash_algorithm: HashAlgorithm,
    pub feature_gate_filter: Option<HashSet<String>>,
    pub dynamic_config_filter: Option<HashSet<String>>,
    pub experiment_filter: Option<HashSet<String>>,
    pub layer_filter: Option<HashSet<String>>,
    /// Leave `id_type` out of gate and config evaluations.
    pub remove_id_type: bool,
}

impl ClientInitResponseOptions {
    pub fn with_hash_algorithm(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    pub fn with_feature_gate_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.feature_gate_filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn keeps(&self, entity: &str, name: &str) -> bool {
        let filter = match entity {
            "feature_gate" => &self.feature_gate_filter,
            "dynamic_config" => &self.dynamic_config_filter,
            "experiment" => &self.experiment_filter,
            "layer" => &self.layer_filter,
            _ => return true,
        };
        filter.as_ref().map_or(true, |names| names.contains(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateEvaluation {
    pub name: String,
    pub value: bool,
    pub rule_id: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
}

/// A dynamic config or experiment. Experiment-only fields are left out for dynamic configs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEvaluation {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    /// Same as `rule_id`.
    pub group: String,
    pub is_device_based: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_in_layer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_in_experiment: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerEvaluation {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    /// Same as `rule_id`.
    pub group: String,
    pub is_device_based: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    pub explicit_parameters: Vec<String>,
    /// Hashed like entity names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_in_experiment: Option<bool>,
}

/// Ids the response was computed for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluatedKeys {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs", skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
}

/// Every gate, dynamic config, experiment and layer evaluated for one user, keyed by hashed
/// name. Serializes to the JSON client SDKs initialize from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInitializeResponse {
    pub feature_gates: HashMap<String, GateEvaluation>,
    pub dynamic_configs: HashMap<String, ConfigEvaluation>,
    pub layer_configs: HashMap<String, LayerEvaluation>,
    /// `lcut` of the snapshot evaluated against, `0` before specs arrive.
    pub time: u64,
    pub has_updates: bool,
    pub hash_used: HashAlgorithm,
    /// Private attributes are never serialized.
    pub user: User,
    pub evaluated_keys: EvaluatedKeys,
    #[serde(rename = "sdkInfo")]
    pub sdk_info: HashMap<String, String>,
}

/// Build a response for `user`. Entities are evaluated through `evaluate`, so the caller decides
/// about overrides and exposure logging.
pub(crate) fn format_client_initialize_response(
    snapshot: Option<&SpecsSnapshot>,
    user: &User,
    options: &ClientInitResponseOptions,
    mut evaluate: impl FnMut(EntityKind, &str) -> EvaluationResult,
) -> ClientInitializeResponse {
    let hashing = options.hash_algorithm;
    let mut response = ClientInitializeResponse {
        feature_gates: HashMap::new(),
        dynamic_configs: HashMap::new(),
        layer_configs: HashMap::new(),
        time: 0,
        has_updates: false,
        hash_used: hashing,
        user: user.clone(),
        evaluated_keys: EvaluatedKeys {
            user_id: user.user_id.clone(),
            custom_ids: user.custom_ids.clone(),
        },
        sdk_info: HashMap::from([
            ("sdkType".to_owned(), SDK_TYPE.to_owned()),
            ("sdkVersion".to_owned(), SDK_VERSION.to_owned()),
        ]),
    };
    let Some(snapshot) = snapshot else {
        return response;
    };
    response.time = snapshot.lcut;
    response.has_updates = true;
    let values = &snapshot.values;

    for (name, spec) in client_visible(&values.feature_gates, options) {
        let result = evaluate(EntityKind::Gate, name);
        response.feature_gates.insert(
            hashing.hash_name(name),
            GateEvaluation {
                name: hashing.hash_name(name),
                value: result.bool_value,
                rule_id: result.rule_id,
                secondary_exposures: hash_exposures(result.secondary_exposures, hashing),
                id_type: (!options.remove_id_type).then(|| spec.id_type.clone()),
            },
        );
    }

    for (name, spec) in client_visible(&values.dynamic_configs, options) {
        let is_experiment = spec.entity != "dynamic_config";
        let kind = if is_experiment {
            EntityKind::Experiment
        } else {
            EntityKind::DynamicConfig
        };
        let result = evaluate(kind, name);
        let mut evaluation = ConfigEvaluation {
            name: hashing.hash_name(name),
            group: result.rule_id.clone(),
            rule_id: result.rule_id,
            value: result.json_value,
            is_device_based: is_device_based(&spec.id_type),
            secondary_exposures: hash_exposures(result.secondary_exposures, hashing),
            id_type: (!options.remove_id_type).then(|| spec.id_type.clone()),
            passed: None,
            is_in_layer: false,
            explicit_parameters: None,
            group_name: None,
            is_experiment_active: None,
            is_user_in_experiment: None,
        };
        if is_experiment {
            evaluation.is_in_layer = result.is_in_layer;
            evaluation.explicit_parameters = Some(result.explicit_parameters);
            evaluation.group_name = result.group_name;
            evaluation.is_experiment_active = Some(result.is_experiment_active);
            evaluation.is_user_in_experiment = Some(result.is_experiment_group);
        } else {
            evaluation.passed = Some(result.bool_value);
        }
        response
            .dynamic_configs
            .insert(evaluation.name.clone(), evaluation);
    }

    for (name, spec) in client_visible(&values.layers, options) {
        let result = evaluate(EntityKind::Layer, name);
        let evaluation = LayerEvaluation {
            name: hashing.hash_name(name),
            group: result.rule_id.clone(),
            rule_id: result.rule_id,
            value: result.json_value,
            is_device_based: is_device_based(&spec.id_type),
            secondary_exposures: hash_exposures(result.secondary_exposures, hashing),
            undelegated_secondary_exposures: hash_exposures(
                result.undelegated_secondary_exposures.unwrap_or_default(),
                hashing,
            ),
            explicit_parameters: result.explicit_parameters,
            allocated_experiment_name: result
                .config_delegate
                .map(|experiment| hashing.hash_name(&experiment)),
            group_name: result.group_name,
            is_experiment_active: Some(result.is_experiment_active),
            is_user_in_experiment: Some(result.is_experiment_group),
        };
        response
            .layer_configs
            .insert(evaluation.name.clone(), evaluation);
    }

    log::debug!(target: "switchyard",
        gates = response.feature_gates.len(),
        configs = response.dynamic_configs.len(),
        layers = response.layer_configs.len();
        "formatted client initialize response");
    response
}

/// Parsed specs a client may see: segments and holdouts are internal, filters apply.
fn client_visible<'s>(
    specs: &'s HashMap<String, TryParse<Spec>>,
    options: &'s ClientInitResponseOptions,
) -> impl Iterator<Item = (&'s str, &'s Spec)> {
    specs.iter().filter_map(move |(name, spec)| {
        let spec = Option::<&Spec>::from(spec)?;
        if matches!(spec.entity.as_str(), "segment" | "holdout") {
            return None;
        }
        options
            .keeps(&spec.entity, name)
            .then_some((name.as_str(), spec))
    })
}

fn is_device_based(id_type: &str) -> bool {
    id_type.eq_ignore_ascii_case("stableid")
}

/// Drop duplicate exposures and hash gate names.
fn hash_exposures(
    exposures: Vec<SecondaryExposure>,
    hashing: HashAlgorithm,
) -> Vec<SecondaryExposure> {
    let mut seen = HashSet::new();
    exposures
        .into_iter()
        .filter(|exposure| seen.insert(exposure.clone()))
        .map(|exposure| SecondaryExposure {
            gate: hashing.hash_name(&exposure.gate),
            ..exposure
        })
        .collect()
}
