//! Wire model of the rule specification downloaded by specs adapters.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Full specs download. `time` is the `lcut` of the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecsResponse {
    #[serde(default)]
    pub feature_gates: HashMap<String, TryParse<Spec>>,
    /// Dynamic configs and experiments share a namespace.
    #[serde(default)]
    pub dynamic_configs: HashMap<String, TryParse<Spec>>,
    #[serde(default, alias = "layer_configs")]
    pub layers: HashMap<String, TryParse<Spec>>,
    #[serde(default, alias = "param_stores")]
    pub parameter_stores: HashMap<String, ParameterStoreSpec>,
    /// Shared conditions referenced from rules by key.
    #[serde(default)]
    pub condition_map: HashMap<String, Condition>,
    #[serde(default)]
    pub experiment_to_layer: HashMap<String, String>,
    #[serde(default)]
    pub id_lists: HashMap<String, IdListRef>,
    #[serde(default, alias = "lcut")]
    pub time: Option<u64>,
    #[serde(default = "default_has_updates")]
    pub has_updates: bool,
}

fn default_has_updates() -> bool {
    true
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(Value),
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A rule-bearing entity: gate, dynamic config, experiment or layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(rename = "type", default)]
    pub spec_type: String,
    /// `feature_gate`, `dynamic_config`, `experiment`, `layer`, `segment`, `holdout`, ...
    #[serde(default)]
    pub entity: String,
    pub salt: String,
    pub default_value: ReturnValue,
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub has_shared_params: Option<bool>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub version: Option<u32>,
    /// Assignments of sticky entities are persisted through
    /// [`PersistentStorage`](crate::PersistentStorage).
    #[serde(default)]
    pub is_sticky: bool,
}

pub(crate) fn default_id_type() -> String {
    "userID".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub salt: Option<String>,
    pub pass_percentage: f64,
    pub return_value: ReturnValue,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    /// Implicit AND over all nodes.
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
    #[serde(default)]
    pub group_name: Option<String>,
    /// Name of the experiment a layer rule allocates the user to.
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub is_experiment_group: Option<bool>,
}

/// Value returned by a rule or used as an entity default. Gates use booleans, everything else
/// uses JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnValue {
    Boolean(bool),
    Object(Map<String, Value>),
    Other(Value),
}

impl ReturnValue {
    /// Gate value when a rule passes: anything but an explicit `false` passes.
    pub(crate) fn passing_bool(&self) -> bool {
        !matches!(self, ReturnValue::Boolean(false))
    }

    /// Gate value when falling back to the default: only an explicit `true` passes.
    pub(crate) fn default_bool(&self) -> bool {
        matches!(self, ReturnValue::Boolean(true))
    }

    pub(crate) fn to_map(&self) -> Map<String, Value> {
        match self {
            ReturnValue::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// A node of a rule's condition tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    /// Passes when every child passes.
    All { all: Vec<ConditionNode> },
    /// Passes when at least one child passes.
    Any { any: Vec<ConditionNode> },
    /// Key into [`SpecsResponse::condition_map`].
    Ref(String),
    Leaf(Condition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub target_value: Option<Value>,
    #[serde(default)]
    pub additional_values: Option<HashMap<String, Value>>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Public,
    PassGate,
    FailGate,
    UserField,
    IpBased,
    UaBased,
    EnvironmentField,
    CurrentTime,
    UserBucket,
    UnitId,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    VersionGt,
    VersionGte,
    VersionLt,
    VersionLte,
    VersionEq,
    VersionNeq,
    Any,
    None,
    AnyCaseSensitive,
    NoneCaseSensitive,
    StrStartsWithAny,
    StrEndsWithAny,
    StrContainsAny,
    StrContainsNone,
    StrMatches,
    Eq,
    Neq,
    Before,
    After,
    On,
    InSegmentList,
    NotInSegmentList,
    ArrayContainsAny,
    ArrayContainsNone,
    ArrayContainsAll,
    NotArrayContainsAll,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterStoreSpec {
    #[serde(default)]
    pub parameters: HashMap<String, TryParse<Parameter>>,
}

/// A parameter store entry, resolved by reference type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ref_type", rename_all = "snake_case")]
pub enum Parameter {
    Static {
        value: Value,
    },
    Gate {
        gate_name: String,
        pass_value: Value,
        fail_value: Value,
    },
    DynamicConfig {
        config_name: String,
        param_name: String,
    },
    Experiment {
        experiment_name: String,
        param_name: String,
    },
    Layer {
        layer_name: String,
        param_name: String,
    },
}

/// Id lists in a specs payload either declare that a list exists, or carry its (hashed) ids
/// inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdListRef {
    Declared(bool),
    Inline(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::{
        ConditionNode, ConditionType, Operator, Parameter, ReturnValue, SpecsResponse, TryParse,
    };

    #[test]
    fn parse_partially_if_unexpected() {
        let specs: SpecsResponse = serde_json::from_str(
            r#"
              {
                "time": 10,
                "feature_gates": {
                  "success": {
                    "type": "feature_gate",
                    "salt": "s",
                    "defaultValue": false,
                    "enabled": true,
                    "rules": []
                  },
                  "fail_parsing": {
                    "type": "feature_gate",
                    "enabled": "yes"
                  }
                }
              }
            "#,
        )
        .unwrap();
        assert!(matches!(
            specs.feature_gates.get("success").unwrap(),
            TryParse::Parsed(_)
        ));
        assert!(matches!(
            specs.feature_gates.get("fail_parsing").unwrap(),
            TryParse::ParseFailed(_)
        ));
        assert!(specs.has_updates);
        assert_eq!(specs.time, Some(10));
    }

    #[test]
    fn parse_condition_tree() {
        let nodes: Vec<ConditionNode> = serde_json::from_str(
            r#"[
              "hash_1",
              {"type": "public"},
              {"any": [
                {"type": "user_field", "field": "email", "operator": "str_contains_any", "targetValue": ["@a.com"]},
                {"all": [{"type": "some_future_type"}]}
              ]}
            ]"#,
        )
        .unwrap();

        assert!(matches!(&nodes[0], ConditionNode::Ref(key) if key == "hash_1"));
        assert!(
            matches!(&nodes[1], ConditionNode::Leaf(c) if c.condition_type == ConditionType::Public)
        );
        let ConditionNode::Any { any } = &nodes[2] else {
            panic!("expected `any` node");
        };
        assert!(matches!(&any[0], ConditionNode::Leaf(c)
            if c.operator == Some(Operator::StrContainsAny) && c.id_type == "userID"));
        let ConditionNode::All { all } = &any[1] else {
            panic!("expected `all` node");
        };
        assert!(
            matches!(&all[0], ConditionNode::Leaf(c) if c.condition_type == ConditionType::Unknown)
        );
    }

    #[test]
    fn accepts_alternative_top_level_names() {
        let specs: SpecsResponse = serde_json::from_str(
            r#"{"lcut": 3, "layer_configs": {}, "param_stores": {"store": {"parameters": {
                "p": {"ref_type": "static", "param_type": "string", "value": "v"}
            }}}}"#,
        )
        .unwrap();
        assert_eq!(specs.time, Some(3));
        let store = &specs.parameter_stores["store"];
        assert!(matches!(
            &store.parameters["p"],
            TryParse::Parsed(Parameter::Static { value }) if value == "v"
        ));
    }

    #[test]
    fn return_value_truthiness() {
        assert!(ReturnValue::Boolean(true).passing_bool());
        assert!(!ReturnValue::Boolean(false).passing_bool());
        assert!(ReturnValue::Object(Default::default()).passing_bool());
        assert!(!ReturnValue::Object(Default::default()).default_bool());
    }
}
