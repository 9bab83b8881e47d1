//! Rule evaluation against a published specs snapshot.
use std::fmt;

use serde::{Deserialize, Serialize};

mod conditions;
mod details;
mod evaluator;

pub use details::{EvaluationDetails, EvaluationReason};
pub(crate) use evaluator::{resolve_parameter, EvaluationResult, EvaluatorContext};

/// Kind of entity being evaluated. Dynamic configs and experiments share a namespace in the specs
/// but are evaluated and logged differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Gate,
    DynamicConfig,
    Experiment,
    Layer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Gate => "gate",
            EntityKind::DynamicConfig => "dynamic config",
            EntityKind::Experiment => "experiment",
            EntityKind::Layer => "layer",
        })
    }
}

/// A gate evaluated as a dependency of the entity being exposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryExposure {
    pub gate: String,
    pub gate_value: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}
