use std::fmt;

use serde::{Serialize, Serializer};

use crate::spec_store::{SpecsSnapshot, SpecsSource};

/// Why an evaluation produced its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationReason {
    /// No specs have been received yet.
    Uninitialized,
    /// The value was forced by an override.
    LocalOverride,
    /// The entity exists in specs from the given source.
    Recognized(SpecsSource),
    /// The entity is absent from specs from the given source.
    Unrecognized(SpecsSource),
    /// The entity uses a condition type or operator this engine does not know.
    Unsupported(SpecsSource),
    /// The value was reused from persistent storage.
    Persisted,
    /// Evaluation failed, e.g. gate nesting was too deep.
    Error,
}

impl fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationReason::Uninitialized => f.write_str("Uninitialized"),
            EvaluationReason::LocalOverride => f.write_str("LocalOverride"),
            EvaluationReason::Recognized(source) => write!(f, "{source}:Recognized"),
            EvaluationReason::Unrecognized(source) => write!(f, "{source}:Unrecognized"),
            EvaluationReason::Unsupported(source) => write!(f, "{source}:Unsupported"),
            EvaluationReason::Persisted => f.write_str("Persisted"),
            EvaluationReason::Error => f.write_str("Error"),
        }
    }
}

impl Serialize for EvaluationReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Provenance attached to every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails {
    /// `lcut` of the snapshot the decision was made against.
    pub lcut: Option<u64>,
    /// When that snapshot was received, in milliseconds since epoch.
    pub received_at: Option<u64>,
    pub reason: EvaluationReason,
}

impl EvaluationDetails {
    pub(crate) fn uninitialized() -> EvaluationDetails {
        EvaluationDetails {
            lcut: None,
            received_at: None,
            reason: EvaluationReason::Uninitialized,
        }
    }

    pub(crate) fn for_snapshot(
        snapshot: Option<&SpecsSnapshot>,
        reason: impl FnOnce(SpecsSource) -> EvaluationReason,
    ) -> EvaluationDetails {
        match snapshot {
            Some(snapshot) => EvaluationDetails {
                lcut: Some(snapshot.lcut),
                received_at: Some(snapshot.received_at),
                reason: reason(snapshot.source.clone()),
            },
            None => EvaluationDetails::uninitialized(),
        }
    }

    pub(crate) fn with_reason(
        snapshot: Option<&SpecsSnapshot>,
        reason: EvaluationReason,
    ) -> EvaluationDetails {
        EvaluationDetails {
            lcut: snapshot.map(|s| s.lcut),
            received_at: snapshot.map(|s| s.received_at),
            reason,
        }
    }
}
