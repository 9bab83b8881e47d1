use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use crate::{
    id_lists::IdList,
    sharder::id_list_hash,
    specs::Operator,
    user::{format_float, AttributeValue},
};

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    ///
    /// Id-list operators need the snapshot and are handled by [`eval_id_list`].
    pub fn eval(&self, value: Option<&AttributeValue>, target: Option<&Value>) -> bool {
        self.try_eval(value, target).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, value: Option<&AttributeValue>, target: Option<&Value>) -> Option<bool> {
        match self {
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let value = value?.to_f64()?;
                let target = json_to_f64(target?)?;
                Some(match self {
                    Self::Gt => value > target,
                    Self::Gte => value >= target,
                    Self::Lt => value < target,
                    _ => value <= target,
                })
            }

            Self::VersionGt
            | Self::VersionGte
            | Self::VersionLt
            | Self::VersionLte
            | Self::VersionEq
            | Self::VersionNeq => {
                let value = parse_version(&value?.to_comparable_string()?)?;
                let target = parse_version(&json_to_string(target?)?)?;
                let ordering = compare_versions(&value, &target);
                Some(match self {
                    Self::VersionGt => ordering == Ordering::Greater,
                    Self::VersionGte => ordering != Ordering::Less,
                    Self::VersionLt => ordering == Ordering::Less,
                    Self::VersionLte => ordering != Ordering::Greater,
                    Self::VersionEq => ordering == Ordering::Equal,
                    _ => ordering != Ordering::Equal,
                })
            }

            Self::Any
            | Self::None
            | Self::AnyCaseSensitive
            | Self::NoneCaseSensitive
            | Self::StrStartsWithAny
            | Self::StrEndsWithAny
            | Self::StrContainsAny
            | Self::StrContainsNone => {
                let ignore_case = !matches!(self, Self::AnyCaseSensitive | Self::NoneCaseSensitive);
                let targets = json_to_strings(target?)?;
                // A missing value matches no target, so only the negated operators pass.
                let Some(value) = value.and_then(AttributeValue::to_comparable_string) else {
                    return Some(matches!(
                        self,
                        Self::None | Self::NoneCaseSensitive | Self::StrContainsNone
                    ));
                };

                let normalize = |s: &str| {
                    if ignore_case {
                        s.to_lowercase()
                    } else {
                        s.to_owned()
                    }
                };
                let value = normalize(&value);
                let found = targets.iter().map(|t| normalize(t)).any(|t| match self {
                    Self::StrStartsWithAny => value.starts_with(&t),
                    Self::StrEndsWithAny => value.ends_with(&t),
                    Self::StrContainsAny | Self::StrContainsNone => value.contains(&t),
                    _ => value == t,
                });

                Some(match self {
                    Self::None | Self::NoneCaseSensitive | Self::StrContainsNone => !found,
                    _ => found,
                })
            }

            Self::StrMatches => {
                let value = value?.to_comparable_string()?;
                let regex = Regex::new(target?.as_str()?).ok()?;
                Some(regex.is_match(&value))
            }

            Self::Eq | Self::Neq => {
                let value = value.map(Value::from).unwrap_or(Value::Null);
                let target = target.unwrap_or(&Value::Null);
                let equal = json_loosely_equal(&value, target);
                Some(if *self == Self::Eq { equal } else { !equal })
            }

            Self::Before | Self::After | Self::On => {
                let value = attribute_to_time(value?)?;
                let target = json_to_time(target?)?;
                Some(match self {
                    Self::Before => value < target,
                    Self::After => value > target,
                    _ => value.date_naive() == target.date_naive(),
                })
            }

            Self::ArrayContainsAny
            | Self::ArrayContainsNone
            | Self::ArrayContainsAll
            | Self::NotArrayContainsAll => {
                let AttributeValue::Array(items) = value? else {
                    return None;
                };
                let items = items
                    .iter()
                    .filter_map(AttributeValue::to_comparable_string)
                    .collect::<Vec<_>>();
                let targets = json_to_strings(target?)?;
                let contains = |t: &String| items.contains(t);
                Some(match self {
                    Self::ArrayContainsAny => targets.iter().any(contains),
                    Self::ArrayContainsNone => !targets.iter().any(contains),
                    Self::ArrayContainsAll => targets.iter().all(contains),
                    _ => !targets.iter().all(contains),
                })
            }

            Self::InSegmentList | Self::NotInSegmentList | Self::Unknown => None,
        }
    }
}

/// Evaluate `in_segment_list`/`not_in_segment_list`. The target names the list, the value is
/// looked up by its hashed form.
pub(crate) fn eval_id_list(
    operator: Operator,
    value: Option<&AttributeValue>,
    target: Option<&Value>,
    id_lists: &HashMap<String, Arc<IdList>>,
) -> bool {
    let in_list = (|| {
        let list = id_lists.get(target?.as_str()?)?;
        let value = value?.to_comparable_string()?;
        Some(list.contains_hashed(&id_list_hash(&value)))
    })()
    .unwrap_or(false);

    if operator == Operator::NotInSegmentList {
        !in_list
    } else {
        in_list
    }
}

fn json_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(format_float),
        },
        _ => None,
    }
}

/// Targets are usually arrays, a single scalar is treated as a one-element array.
fn json_to_strings(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(values) => Some(values.iter().filter_map(json_to_string).collect()),
        other => json_to_string(other).map(|s| vec![s]),
    }
}

fn json_loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

/// Parse a dotted numeric version, ignoring a leading `v` and any pre-release or build suffix.
fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let version = version.split(['-', '+']).next()?;
    if version.is_empty() {
        return None;
    }
    version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Compare component by component, treating missing components as zero.
fn compare_versions(left: &[u64], right: &[u64]) -> Ordering {
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn string_to_time(s: &str) -> Option<DateTime<Utc>> {
    match s.trim().parse::<i64>() {
        Ok(millis) => millis_to_time(millis),
        Err(_) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
    }
}

fn attribute_to_time(value: &AttributeValue) -> Option<DateTime<Utc>> {
    match value {
        AttributeValue::Integer(i) => millis_to_time(*i),
        AttributeValue::Float(f) => millis_to_time(*f as i64),
        AttributeValue::String(s) => string_to_time(s),
        _ => None,
    }
}

fn json_to_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => millis_to_time(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?),
        Value::String(s) => string_to_time(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use serde_json::json;

    use crate::{id_lists::IdList, specs::Operator, user::AttributeValue};

    use super::eval_id_list;

    #[test]
    fn numeric_comparisons() {
        assert!(Operator::Gt.eval(Some(&19.into()), Some(&json!(18))));
        assert!(!Operator::Gt.eval(Some(&18.into()), Some(&json!(18))));
        assert!(Operator::Gte.eval(Some(&18.into()), Some(&json!(18))));
        assert!(Operator::Lt.eval(Some(&17.5.into()), Some(&json!(18))));
        assert!(Operator::Lte.eval(Some(&"18".into()), Some(&json!("18"))));
        assert!(!Operator::Lt.eval(None, Some(&json!(18))));
        assert!(!Operator::Gt.eval(Some(&"abc".into()), Some(&json!(1))));
    }

    #[test]
    fn version_comparisons() {
        assert!(Operator::VersionGt.eval(Some(&"1.10.0".into()), Some(&json!("1.2.0"))));
        assert!(Operator::VersionGte.eval(Some(&"1.2".into()), Some(&json!("1.2.0"))));
        assert!(Operator::VersionEq.eval(Some(&"v2.0.0-beta".into()), Some(&json!("2.0"))));
        assert!(Operator::VersionLt.eval(Some(&"1.2.3".into()), Some(&json!("1.2.3.1"))));
        assert!(Operator::VersionLte.eval(Some(&"0.9.9".into()), Some(&json!("1.0.0"))));
        assert!(Operator::VersionNeq.eval(Some(&"1.0.1".into()), Some(&json!("1.0.0"))));
        assert!(!Operator::VersionGt.eval(Some(&"not.a.version".into()), Some(&json!("1.0"))));
        assert!(!Operator::VersionEq.eval(None, Some(&json!("1.0"))));
    }

    #[test]
    fn any_is_case_insensitive() {
        let target = json!(["alice", "BOB"]);
        assert!(Operator::Any.eval(Some(&"Alice".into()), Some(&target)));
        assert!(Operator::Any.eval(Some(&"bob".into()), Some(&target)));
        assert!(!Operator::Any.eval(Some(&"charlie".into()), Some(&target)));
        assert!(Operator::None.eval(Some(&"charlie".into()), Some(&target)));
        assert!(!Operator::None.eval(Some(&"ALICE".into()), Some(&target)));
    }

    #[test]
    fn none_passes_when_value_is_missing() {
        assert!(Operator::None.eval(None, Some(&json!(["alice"]))));
        assert!(!Operator::Any.eval(None, Some(&json!(["alice"]))));
    }

    #[test]
    fn missing_value_never_matches_empty_string_target() {
        let target = json!([""]);
        assert!(!Operator::Any.eval(None, Some(&target)));
        assert!(!Operator::AnyCaseSensitive.eval(None, Some(&target)));
        assert!(!Operator::StrStartsWithAny.eval(None, Some(&target)));
        assert!(!Operator::StrContainsAny.eval(None, Some(&target)));
        assert!(Operator::NoneCaseSensitive.eval(None, Some(&target)));
        assert!(Operator::StrContainsNone.eval(None, Some(&target)));

        assert!(Operator::Any.eval(Some(&"".into()), Some(&target)));
    }

    #[test]
    fn case_sensitive_variants() {
        let target = json!(["Alice"]);
        assert!(Operator::AnyCaseSensitive.eval(Some(&"Alice".into()), Some(&target)));
        assert!(!Operator::AnyCaseSensitive.eval(Some(&"alice".into()), Some(&target)));
        assert!(Operator::NoneCaseSensitive.eval(Some(&"alice".into()), Some(&target)));
    }

    #[test]
    fn any_compares_numbers_as_strings() {
        assert!(Operator::Any.eval(Some(&42.into()), Some(&json!(["42", "43"]))));
        assert!(Operator::Any.eval(Some(&42.0.into()), Some(&json!([42]))));
        assert!(Operator::Any.eval(Some(&true.into()), Some(&json!(["true"]))));
    }

    #[test]
    fn string_affixes() {
        let value = AttributeValue::from("daniel@example.com");
        assert!(Operator::StrStartsWithAny.eval(Some(&value), Some(&json!(["tore", "DANIEL"]))));
        assert!(Operator::StrEndsWithAny.eval(Some(&value), Some(&json!(["@example.com"]))));
        assert!(Operator::StrContainsAny.eval(Some(&value), Some(&json!(["example"]))));
        assert!(!Operator::StrContainsNone.eval(Some(&value), Some(&json!(["example"]))));
        assert!(Operator::StrContainsNone.eval(Some(&value), Some(&json!(["other"]))));
    }

    #[test]
    fn matches_regex() {
        assert!(Operator::StrMatches.eval(Some(&"test@example.com".into()), Some(&json!("^test.*"))));
        assert!(!Operator::StrMatches.eval(Some(&"example@test.com".into()), Some(&json!("^test.*"))));
        assert!(!Operator::StrMatches.eval(Some(&"x".into()), Some(&json!("("))));
        assert!(!Operator::StrMatches.eval(None, Some(&json!(".*"))));
    }

    #[test]
    fn strict_equality() {
        assert!(Operator::Eq.eval(Some(&"a".into()), Some(&json!("a"))));
        assert!(Operator::Eq.eval(Some(&1.into()), Some(&json!(1.0))));
        assert!(!Operator::Eq.eval(Some(&"1".into()), Some(&json!(1))));
        assert!(Operator::Eq.eval(None, Some(&json!(null))));
        assert!(Operator::Eq.eval(None, None));
        assert!(Operator::Neq.eval(Some(&"a".into()), Some(&json!("b"))));
        assert!(!Operator::Neq.eval(Some(&true.into()), Some(&json!(true))));
    }

    #[test]
    fn time_comparisons() {
        // 2024-01-01T00:00:00Z
        let new_year = 1_704_067_200_000_i64;
        assert!(Operator::Before.eval(Some(&(new_year - 1).into()), Some(&json!(new_year))));
        assert!(Operator::After.eval(Some(&(new_year + 1).into()), Some(&json!(new_year))));
        assert!(Operator::After.eval(
            Some(&"2024-06-01T00:00:00Z".into()),
            Some(&json!("2024-01-01T00:00:00Z"))
        ));
        assert!(Operator::On.eval(
            Some(&(new_year + 3_600_000).into()),
            Some(&json!(new_year.to_string()))
        ));
        assert!(!Operator::On.eval(
            Some(&(new_year + 86_400_000).into()),
            Some(&json!(new_year))
        ));
        assert!(!Operator::Before.eval(Some(&"yesterday".into()), Some(&json!(new_year))));
    }

    #[test]
    fn array_operators() {
        let value = AttributeValue::Array(vec!["a".into(), "b".into(), 3.into()]);
        assert!(Operator::ArrayContainsAny.eval(Some(&value), Some(&json!(["x", "b"]))));
        assert!(!Operator::ArrayContainsAny.eval(Some(&value), Some(&json!(["x"]))));
        assert!(Operator::ArrayContainsNone.eval(Some(&value), Some(&json!(["x"]))));
        assert!(Operator::ArrayContainsAll.eval(Some(&value), Some(&json!(["a", 3]))));
        assert!(!Operator::ArrayContainsAll.eval(Some(&value), Some(&json!(["a", "z"]))));
        assert!(Operator::NotArrayContainsAll.eval(Some(&value), Some(&json!(["a", "z"]))));
        assert!(!Operator::ArrayContainsAny.eval(Some(&"a".into()), Some(&json!(["a"]))));
    }

    #[test]
    fn unknown_operator_never_passes() {
        assert!(!Operator::Unknown.eval(Some(&"a".into()), Some(&json!("a"))));
    }

    #[test]
    fn segment_lists_match_hashed_ids() {
        let id_lists = HashMap::from([(
            "beta_users".to_owned(),
            Arc::new(IdList::from_hashed_ids("beta_users", ["u4IDDbwr"])),
        )]);
        let target = json!("beta_users");

        assert!(eval_id_list(Operator::InSegmentList, Some(&"u1".into()), Some(&target), &id_lists));
        assert!(!eval_id_list(Operator::InSegmentList, Some(&"u2".into()), Some(&target), &id_lists));
        assert!(eval_id_list(Operator::NotInSegmentList, Some(&"u2".into()), Some(&target), &id_lists));
        assert!(!eval_id_list(
            Operator::InSegmentList,
            Some(&"u1".into()),
            Some(&json!("unknown_list")),
            &id_lists
        ));
    }
}
