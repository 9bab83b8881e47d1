use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::{
    overrides::{OverrideStore, ResolvedOverride},
    persistent_storage::{PersistentStorage, StickyValues, UserPersistedValues},
    sharder::{Sharder, TOTAL_BUCKETS},
    spec_store::SpecsSnapshot,
    specs::{
        default_id_type, Condition, ConditionNode, ConditionType, Operator, Parameter, Rule, Spec,
        SpecsResponse, TryParse,
    },
    unix_time_millis,
    user::AttributeValue,
    User,
};

use super::{
    conditions::eval_id_list, EntityKind, EvaluationDetails, EvaluationReason, SecondaryExposure,
};

/// Nested gate evaluations deeper than this abort with [`EvaluationReason::Error`]. Also stops
/// gates that reference each other in a cycle.
const MAX_NESTING_DEPTH: usize = 64;

const DEFAULT_RULE_ID: &str = "default";
const DISABLED_RULE_ID: &str = "disabled";

/// `user_bucket` conditions hash into this many buckets.
const USER_BUCKET_COUNT: u64 = 1000;

/// Reasons evaluation of an entity stops without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Unsupported,
    DepthExceeded,
}

/// Outcome of evaluating one entity for one user.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EvaluationResult {
    pub bool_value: bool,
    pub json_value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    pub is_experiment_group: bool,
    pub is_experiment_active: bool,
    pub is_in_layer: bool,
    /// Experiment a layer allocated the user to.
    pub config_delegate: Option<String>,
    pub explicit_parameters: Vec<String>,
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// Exposures recorded before a layer delegated to its experiment.
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    pub version: Option<u32>,
    pub details: EvaluationDetails,
}

impl EvaluationResult {
    /// Zero value: `false` and an empty map.
    fn empty(id_type: String, details: EvaluationDetails) -> EvaluationResult {
        EvaluationResult {
            bool_value: false,
            json_value: Map::new(),
            rule_id: String::new(),
            id_type,
            group_name: None,
            is_experiment_group: false,
            is_experiment_active: false,
            is_in_layer: false,
            config_delegate: None,
            explicit_parameters: Vec::new(),
            secondary_exposures: Vec::new(),
            undelegated_secondary_exposures: None,
            version: None,
            details,
        }
    }

    /// Spec-level metadata shared by every outcome of `spec`.
    fn for_spec(spec: &Spec, details: EvaluationDetails) -> EvaluationResult {
        EvaluationResult {
            is_experiment_active: spec.is_active.unwrap_or(false),
            is_in_layer: spec.has_shared_params.unwrap_or(false),
            explicit_parameters: spec.explicit_parameters.clone().unwrap_or_default(),
            version: spec.version,
            ..EvaluationResult::empty(spec.id_type.clone(), details)
        }
    }

    fn from_override(
        resolved: ResolvedOverride,
        spec: Option<&Spec>,
        details: EvaluationDetails,
    ) -> EvaluationResult {
        let mut result = match spec {
            Some(spec) => EvaluationResult::for_spec(spec, details),
            None => EvaluationResult::empty(default_id_type(), details),
        };
        result.bool_value = resolved.bool_value;
        result.json_value = resolved.json_value;
        result.rule_id = resolved.rule_id;
        result.group_name = resolved.group_name;
        result
    }

    fn with_rule(mut self, spec: &Spec, rule: &Rule, passed: bool) -> EvaluationResult {
        let value = if passed {
            &rule.return_value
        } else {
            &spec.default_value
        };
        self.bool_value = if passed {
            value.passing_bool()
        } else {
            value.default_bool()
        };
        self.json_value = value.to_map();
        self.rule_id = rule.id.clone();
        self.group_name = rule.group_name.clone();
        self.is_experiment_group = rule.is_experiment_group.unwrap_or(false);
        self
    }

    fn with_persisted(mut self, persisted: StickyValues, details: EvaluationDetails) -> EvaluationResult {
        self.bool_value = persisted.value;
        self.json_value = persisted.json_value.unwrap_or_default();
        self.rule_id = persisted.rule_id;
        self.is_experiment_group = persisted.group_name.is_some();
        self.group_name = persisted.group_name;
        self.secondary_exposures = persisted.secondary_exposures;
        self.undelegated_secondary_exposures = persisted.undelegated_secondary_exposures;
        self.config_delegate = persisted.config_delegate;
        if let Some(explicit_parameters) = persisted.explicit_parameters {
            self.explicit_parameters = explicit_parameters;
        }
        self.details = details;
        self
    }

    fn to_sticky_values(&self) -> StickyValues {
        StickyValues {
            value: self.bool_value,
            json_value: Some(self.json_value.clone()),
            rule_id: self.rule_id.clone(),
            group_name: self.group_name.clone(),
            secondary_exposures: self.secondary_exposures.clone(),
            undelegated_secondary_exposures: self.undelegated_secondary_exposures.clone(),
            config_delegate: self.config_delegate.clone(),
            explicit_parameters: Some(self.explicit_parameters.clone()),
            time: unix_time_millis(),
            config_version: self.version,
        }
    }
}

/// Everything an evaluation reads. Built per top-level call.
pub(crate) struct EvaluatorContext<'a> {
    user: &'a User,
    snapshot: Option<&'a SpecsSnapshot>,
    overrides: &'a OverrideStore,
    sharder: &'a dyn Sharder,
    persistent_storage: Option<&'a dyn PersistentStorage>,
    /// Caller asked for sticky experiment assignment.
    sticky_requested: bool,
    depth: usize,
    /// Persisted values loaded during this evaluation, keyed by storage key.
    persisted: HashMap<String, Option<UserPersistedValues>>,
}

impl<'a> EvaluatorContext<'a> {
    pub fn new(
        user: &'a User,
        snapshot: Option<&'a SpecsSnapshot>,
        overrides: &'a OverrideStore,
        sharder: &'a dyn Sharder,
    ) -> EvaluatorContext<'a> {
        EvaluatorContext {
            user,
            snapshot,
            overrides,
            sharder,
            persistent_storage: None,
            sticky_requested: false,
            depth: 0,
            persisted: HashMap::new(),
        }
    }

    pub fn with_persistent_storage(
        mut self,
        persistent_storage: Option<&'a dyn PersistentStorage>,
        sticky_requested: bool,
    ) -> EvaluatorContext<'a> {
        self.persistent_storage = persistent_storage;
        self.sticky_requested = sticky_requested;
        self
    }

    /// Evaluate `name` for the context user. Never fails: problems are reported through the
    /// result's [`EvaluationReason`].
    pub fn evaluate(&mut self, kind: EntityKind, name: &str) -> EvaluationResult {
        self.depth = 0;
        match self.evaluate_entity(kind, name, true) {
            Ok(result) => result,
            Err(Halt::Unsupported) => EvaluationResult::empty(
                default_id_type(),
                EvaluationDetails::for_snapshot(self.snapshot, EvaluationReason::Unsupported),
            ),
            Err(Halt::DepthExceeded) => {
                log::warn!(target: "switchyard", entity = name, max_depth = MAX_NESTING_DEPTH;
                           "evaluation exceeded maximum gate nesting depth");
                EvaluationResult::empty(
                    default_id_type(),
                    EvaluationDetails::with_reason(self.snapshot, EvaluationReason::Error),
                )
            }
        }
    }

    fn evaluate_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        top_level: bool,
    ) -> Result<EvaluationResult, Halt> {
        let entry = self
            .snapshot
            .and_then(|snapshot| lookup(&snapshot.values, kind, name));
        let spec: Option<&'a Spec> = entry.and_then(Into::into);

        if let Some(resolved) = self.overrides.resolve(kind, name, self.user, spec) {
            let details = EvaluationDetails::with_reason(self.snapshot, EvaluationReason::LocalOverride);
            return Ok(EvaluationResult::from_override(resolved, spec, details));
        }

        let Some(snapshot) = self.snapshot else {
            return Ok(EvaluationResult::empty(
                default_id_type(),
                EvaluationDetails::uninitialized(),
            ));
        };
        match entry {
            None => Ok(EvaluationResult::empty(
                default_id_type(),
                EvaluationDetails::for_snapshot(Some(snapshot), EvaluationReason::Unrecognized),
            )),
            Some(TryParse::ParseFailed(_)) => Err(Halt::Unsupported),
            Some(TryParse::Parsed(spec)) => self.evaluate_spec(snapshot, kind, name, spec, top_level),
        }
    }

    fn evaluate_spec(
        &mut self,
        snapshot: &'a SpecsSnapshot,
        kind: EntityKind,
        name: &str,
        spec: &'a Spec,
        top_level: bool,
    ) -> Result<EvaluationResult, Halt> {
        let base = EvaluationResult::for_spec(
            spec,
            EvaluationDetails::for_snapshot(Some(snapshot), EvaluationReason::Recognized),
        );

        if !spec.enabled {
            return Ok(EvaluationResult {
                bool_value: spec.default_value.default_bool(),
                json_value: spec.default_value.to_map(),
                rule_id: DISABLED_RULE_ID.to_owned(),
                ..base
            });
        }

        let sticky_key = if top_level {
            self.sticky_key(kind, name, spec)
        } else {
            None
        };

        let mut exposures = Vec::new();
        let mut last_matched: Option<&Rule> = None;
        for rule in &spec.rules {
            if !self.evaluate_rule(snapshot, rule, &mut exposures)? {
                continue;
            }

            if let Some(delegated) = self.evaluate_delegate(snapshot, spec, rule, &exposures, &base)? {
                return Ok(delegated);
            }

            if let Some(key) = &sticky_key {
                if let Some(persisted) = self.persisted_value(key, name, &rule.id) {
                    let details = EvaluationDetails::with_reason(Some(snapshot), EvaluationReason::Persisted);
                    return Ok(base.with_persisted(persisted, details));
                }
            }

            if self.passes(spec, rule) {
                let mut result = base.with_rule(spec, rule, true);
                result.secondary_exposures = exposures;
                if let Some(key) = &sticky_key {
                    self.save_sticky(key, name, &result);
                }
                return Ok(result);
            }
            last_matched = Some(rule);
        }

        let mut result = match last_matched {
            Some(rule) => base.with_rule(spec, rule, false),
            None => EvaluationResult {
                bool_value: spec.default_value.default_bool(),
                json_value: spec.default_value.to_map(),
                rule_id: DEFAULT_RULE_ID.to_owned(),
                ..base
            },
        };
        result.secondary_exposures = exposures;
        Ok(result)
    }

    /// Conditions of a rule are an implicit AND. All of them run so that every nested gate
    /// records its exposure.
    fn evaluate_rule(
        &mut self,
        snapshot: &'a SpecsSnapshot,
        rule: &'a Rule,
        exposures: &mut Vec<SecondaryExposure>,
    ) -> Result<bool, Halt> {
        let mut matched = true;
        for node in &rule.conditions {
            let passed = self.evaluate_node(snapshot, node, exposures)?;
            matched = matched && passed;
        }
        Ok(matched)
    }

    fn evaluate_node(
        &mut self,
        snapshot: &'a SpecsSnapshot,
        node: &'a ConditionNode,
        exposures: &mut Vec<SecondaryExposure>,
    ) -> Result<bool, Halt> {
        match node {
            ConditionNode::All { all } => {
                for child in all {
                    if !self.evaluate_node(snapshot, child, exposures)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionNode::Any { any } => {
                for child in any {
                    if self.evaluate_node(snapshot, child, exposures)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionNode::Ref(key) => {
                let Some(condition) = snapshot.values.condition_map.get(key) else {
                    log::debug!(target: "switchyard", condition = key.as_str(); "unknown condition reference");
                    return Err(Halt::Unsupported);
                };
                self.evaluate_condition(snapshot, condition, exposures)
            }
            ConditionNode::Leaf(condition) => self.evaluate_condition(snapshot, condition, exposures),
        }
    }

    fn evaluate_condition(
        &mut self,
        snapshot: &'a SpecsSnapshot,
        condition: &'a Condition,
        exposures: &mut Vec<SecondaryExposure>,
    ) -> Result<bool, Halt> {
        let target = condition.target_value.as_ref();
        let field = condition.field.as_deref();

        let value = match condition.condition_type {
            ConditionType::Public => return Ok(true),
            ConditionType::PassGate | ConditionType::FailGate => {
                return self.evaluate_nested_gate(condition, exposures)
            }
            // Country and user-agent lookups are not available, so these read user fields.
            ConditionType::UserField | ConditionType::IpBased | ConditionType::UaBased => {
                field.and_then(|field| self.user.get_field(field))
            }
            ConditionType::EnvironmentField => {
                field.and_then(|field| self.user.get_environment_field(field))
            }
            ConditionType::CurrentTime => {
                Some(AttributeValue::Integer(Utc::now().timestamp_millis()))
            }
            ConditionType::UserBucket => {
                let salt = condition
                    .additional_values
                    .as_ref()
                    .and_then(|values| values.get("salt"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let unit_id = self.user.get_unit_id(&condition.id_type).unwrap_or("");
                let bucket = self
                    .sharder
                    .get_bucket(&format!("{salt}.{unit_id}"), USER_BUCKET_COUNT);
                Some(AttributeValue::Integer(bucket as i64))
            }
            ConditionType::UnitId => self
                .user
                .get_unit_id(&condition.id_type)
                .map(AttributeValue::from),
            ConditionType::Unknown => return Err(Halt::Unsupported),
        };

        match condition.operator {
            None | Some(Operator::Unknown) => Err(Halt::Unsupported),
            Some(operator @ (Operator::InSegmentList | Operator::NotInSegmentList)) => Ok(
                eval_id_list(operator, value.as_ref(), target, &snapshot.id_lists),
            ),
            Some(operator) => Ok(operator.eval(value.as_ref(), target)),
        }
    }

    fn evaluate_nested_gate(
        &mut self,
        condition: &Condition,
        exposures: &mut Vec<SecondaryExposure>,
    ) -> Result<bool, Halt> {
        let Some(gate) = condition.target_value.as_ref().and_then(Value::as_str) else {
            return Err(Halt::Unsupported);
        };

        let result = self.nested(|ctx| ctx.evaluate_entity(EntityKind::Gate, gate, false))?;
        exposures.extend(result.secondary_exposures);
        if !gate.starts_with("segment:") {
            exposures.push(SecondaryExposure {
                gate: gate.to_owned(),
                gate_value: result.bool_value.to_string(),
                rule_id: result.rule_id,
            });
        }

        Ok(match condition.condition_type {
            ConditionType::FailGate => !result.bool_value,
            _ => result.bool_value,
        })
    }

    /// Allocate the user to the experiment named by the rule's `config_delegate`, if any. The
    /// experiment's values are merged over the defaults of the delegating spec.
    fn evaluate_delegate(
        &mut self,
        snapshot: &'a SpecsSnapshot,
        spec: &Spec,
        rule: &Rule,
        exposures: &[SecondaryExposure],
        base: &EvaluationResult,
    ) -> Result<Option<EvaluationResult>, Halt> {
        let Some(delegate) = rule.config_delegate.as_deref() else {
            return Ok(None);
        };
        let Some(TryParse::Parsed(delegate_spec)) = snapshot.values.dynamic_configs.get(delegate)
        else {
            return Ok(None);
        };

        let delegated =
            self.nested(|ctx| ctx.evaluate_entity(EntityKind::Experiment, delegate, false))?;

        let mut json_value = spec.default_value.to_map();
        json_value.extend(delegated.json_value);
        let mut secondary_exposures = exposures.to_vec();
        secondary_exposures.extend(delegated.secondary_exposures);

        Ok(Some(EvaluationResult {
            bool_value: delegated.bool_value,
            json_value,
            rule_id: delegated.rule_id,
            group_name: delegated.group_name,
            is_experiment_group: delegated.is_experiment_group,
            is_experiment_active: delegated.is_experiment_active,
            config_delegate: Some(delegate.to_owned()),
            explicit_parameters: delegate_spec.explicit_parameters.clone().unwrap_or_default(),
            secondary_exposures,
            undelegated_secondary_exposures: Some(exposures.to_vec()),
            ..base.clone()
        }))
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Halt>,
    ) -> Result<T, Halt> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(Halt::DepthExceeded);
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn passes(&self, spec: &Spec, rule: &Rule) -> bool {
        if rule.pass_percentage >= 100.0 {
            return true;
        }
        if rule.pass_percentage <= 0.0 {
            return false;
        }

        let rule_salt = rule.salt.as_deref().unwrap_or(&rule.id);
        let unit_id = self.user.get_unit_id(&rule.id_type).unwrap_or("");
        let bucket = self
            .sharder
            .get_bucket(&format!("{}.{rule_salt}.{unit_id}", spec.salt), TOTAL_BUCKETS);
        (bucket as f64) < rule.pass_percentage * 100.0
    }

    /// Storage key when `spec` should be sticky for this evaluation. Persisted values of
    /// inactive experiments are deleted.
    fn sticky_key(&mut self, kind: EntityKind, name: &str, spec: &Spec) -> Option<String> {
        let storage = self.persistent_storage?;
        let (requested, active) = if spec.is_sticky {
            (true, spec.is_active != Some(false))
        } else {
            (
                self.sticky_requested && kind == EntityKind::Experiment,
                spec.is_active == Some(true),
            )
        };
        if !requested {
            return None;
        }
        let key = self.user.persistent_storage_key(&spec.id_type)?;

        if !active {
            if let Err(err) = storage.delete(&key, name) {
                log::warn!(target: "switchyard", entity = name; "failed to delete persisted values: {err}");
            }
            if let Some(Some(values)) = self.persisted.get_mut(&key) {
                values.remove(name);
            }
            return None;
        }
        Some(key)
    }

    fn persisted_value(&mut self, key: &str, name: &str, rule_id: &str) -> Option<StickyValues> {
        let storage = self.persistent_storage?;
        let values = self
            .persisted
            .entry(key.to_owned())
            .or_insert_with(|| match storage.load(key) {
                Ok(values) => values,
                Err(err) => {
                    log::warn!(target: "switchyard", key; "failed to load persisted values: {err}");
                    None
                }
            });
        values
            .as_ref()?
            .get(name)
            .filter(|persisted| persisted.rule_id == rule_id)
            .cloned()
    }

    fn save_sticky(&mut self, key: &str, name: &str, result: &EvaluationResult) {
        let Some(storage) = self.persistent_storage else {
            return;
        };
        let values = result.to_sticky_values();
        if let Err(err) = storage.save(key, name, values.clone()) {
            log::warn!(target: "switchyard", entity = name; "failed to persist sticky values: {err}");
            return;
        }
        if let Some(Some(cached)) = self.persisted.get_mut(key) {
            cached.insert(name.to_owned(), values);
        }
    }
}

fn lookup<'s>(values: &'s SpecsResponse, kind: EntityKind, name: &str) -> Option<&'s TryParse<Spec>> {
    match kind {
        EntityKind::Gate => values.feature_gates.get(name),
        EntityKind::DynamicConfig | EntityKind::Experiment => values.dynamic_configs.get(name),
        EntityKind::Layer => values.layers.get(name),
    }
}

/// Resolve a parameter store entry. Referenced entities are evaluated through `evaluate`, so the
/// caller decides about exposure logging.
pub(crate) fn resolve_parameter(
    parameter: &Parameter,
    mut evaluate: impl FnMut(EntityKind, &str) -> EvaluationResult,
) -> Option<Value> {
    match parameter {
        Parameter::Static { value } => Some(value.clone()),
        Parameter::Gate {
            gate_name,
            pass_value,
            fail_value,
        } => {
            let result = evaluate(EntityKind::Gate, gate_name);
            Some(if result.bool_value {
                pass_value.clone()
            } else {
                fail_value.clone()
            })
        }
        Parameter::DynamicConfig {
            config_name,
            param_name,
        } => evaluate(EntityKind::DynamicConfig, config_name)
            .json_value
            .get(param_name)
            .cloned(),
        Parameter::Experiment {
            experiment_name,
            param_name,
        } => evaluate(EntityKind::Experiment, experiment_name)
            .json_value
            .get(param_name)
            .cloned(),
        Parameter::Layer {
            layer_name,
            param_name,
        } => evaluate(EntityKind::Layer, layer_name)
            .json_value
            .get(param_name)
            .cloned(),
    }
}
