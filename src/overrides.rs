//! Manual overrides forcing an entity to a fixed value, for tests and debugging.
use std::{collections::HashMap, sync::RwLock};

use serde_json::{Map, Value};

use crate::{
    eval::EntityKind,
    specs::{ReturnValue, Spec},
    Error, Result, User,
};

/// Value an override forces.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    /// Gate value. Only valid for gates.
    Gate(bool),
    /// Config, experiment or layer value.
    Config(Map<String, Value>),
    /// Experiment group, resolved against the current specs at evaluation time.
    GroupName(String),
}

/// An override resolved for a specific evaluation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedOverride {
    pub bool_value: bool,
    pub json_value: Map<String, Value>,
    pub rule_id: String,
    pub group_name: Option<String>,
}

/// Rule id reported for override decisions.
pub(crate) const OVERRIDE_RULE_ID: &str = "override";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OverrideKey {
    kind: EntityKind,
    name: String,
    /// `None` applies to every user.
    targeting_id: Option<String>,
}

/// In-memory override store.
///
/// Lookup order for a user is: user id, custom ids (ordered by id type), then the override
/// without a targeting id.
#[derive(Debug, Default)]
pub struct OverrideStore {
    overrides: RwLock<HashMap<OverrideKey, OverrideValue>>,
}

impl OverrideStore {
    pub fn new() -> OverrideStore {
        OverrideStore::default()
    }

    pub fn set_override(
        &self,
        kind: EntityKind,
        name: &str,
        targeting_id: Option<&str>,
        value: OverrideValue,
    ) -> Result<()> {
        match (kind, &value) {
            (EntityKind::Gate, OverrideValue::Gate(_)) => {}
            (EntityKind::Gate, _) => {
                return Err(Error::InvalidOverride(format!(
                    "gate `{name}` can only be overridden with a boolean"
                )))
            }
            (_, OverrideValue::Gate(_)) => {
                return Err(Error::InvalidOverride(format!(
                    "{kind} `{name}` cannot be overridden with a boolean"
                )))
            }
            (EntityKind::Experiment, OverrideValue::GroupName(_)) => {}
            (_, OverrideValue::GroupName(_)) => {
                return Err(Error::InvalidOverride(format!(
                    "only experiments can be overridden by group name, `{name}` is a {kind}"
                )))
            }
            (_, OverrideValue::Config(_)) => {}
        }

        let key = OverrideKey {
            kind,
            name: name.to_owned(),
            targeting_id: targeting_id.map(str::to_owned),
        };
        if let Ok(mut overrides) = self.overrides.write() {
            overrides.insert(key, value);
        }
        Ok(())
    }

    /// Remove one override. Returns whether it existed.
    pub fn remove_override(&self, kind: EntityKind, name: &str, targeting_id: Option<&str>) -> bool {
        let key = OverrideKey {
            kind,
            name: name.to_owned(),
            targeting_id: targeting_id.map(str::to_owned),
        };
        self.overrides
            .write()
            .map(|mut overrides| overrides.remove(&key).is_some())
            .unwrap_or(false)
    }

    pub fn remove_all(&self) {
        if let Ok(mut overrides) = self.overrides.write() {
            overrides.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.overrides
            .read()
            .map(|overrides| overrides.is_empty())
            .unwrap_or(true)
    }

    /// Find the override applicable to `user`, if any.
    ///
    /// A group-name override whose group does not exist in `spec` is skipped.
    pub(crate) fn resolve(
        &self,
        kind: EntityKind,
        name: &str,
        user: &User,
        spec: Option<&Spec>,
    ) -> Option<ResolvedOverride> {
        let overrides = self.overrides.read().ok()?;
        if overrides.is_empty() {
            return None;
        }

        let mut custom_ids: Vec<(&String, &String)> = user.custom_ids.iter().collect();
        custom_ids.sort();
        let targeting_ids = user
            .user_id
            .iter()
            .chain(custom_ids.into_iter().map(|(_, id)| id))
            .map(|id| Some(id.clone()))
            .chain(std::iter::once(None));

        for targeting_id in targeting_ids {
            let key = OverrideKey {
                kind,
                name: name.to_owned(),
                targeting_id,
            };
            if let Some(resolved) = overrides.get(&key).and_then(|value| apply(value, spec)) {
                return Some(resolved);
            }
        }
        None
    }
}

fn apply(value: &OverrideValue, spec: Option<&Spec>) -> Option<ResolvedOverride> {
    match value {
        OverrideValue::Gate(value) => Some(ResolvedOverride {
            bool_value: *value,
            json_value: Map::new(),
            rule_id: OVERRIDE_RULE_ID.to_owned(),
            group_name: None,
        }),
        OverrideValue::Config(value) => Some(ResolvedOverride {
            bool_value: true,
            json_value: value.clone(),
            rule_id: OVERRIDE_RULE_ID.to_owned(),
            group_name: None,
        }),
        OverrideValue::GroupName(group) => {
            let rule = spec?
                .rules
                .iter()
                .find(|rule| rule.group_name.as_deref() == Some(group))?;
            Some(ResolvedOverride {
                bool_value: rule.return_value.passing_bool(),
                json_value: match &rule.return_value {
                    ReturnValue::Object(map) => map.clone(),
                    _ => Map::new(),
                },
                rule_id: OVERRIDE_RULE_ID.to_owned(),
                group_name: Some(group.clone()),
            })
        }
    }
}
