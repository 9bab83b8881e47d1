use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a map of custom or private user attributes.
///
/// # Examples
/// ```
/// # use switchyard::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Closed union of values a user attribute can hold.
///
/// ```
/// # use switchyard::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let int_attr: AttributeValue = 42.into();
/// let float_attr: AttributeValue = 4.2.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A boolean value.
    Boolean(bool),
    /// An integer value.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
    /// An array of values.
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Return the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String form used by string comparisons. Arrays have no string form.
    pub fn to_comparable_string(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Integer(i) => Some(i.to_string()),
            AttributeValue::Float(f) => Some(format_float(*f)),
            AttributeValue::Boolean(b) => Some(b.to_string()),
            AttributeValue::Array(_) => None,
        }
    }

    /// Numeric form used by numeric comparisons. Strings are parsed.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::String(s) => s.trim().parse().ok(),
            AttributeValue::Boolean(_) | AttributeValue::Array(_) => None,
        }
    }
}

/// Integral floats print without a fractional part, so `42.0` compares equal to `"42"`.
pub(crate) fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<&AttributeValue> for serde_json::Value {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Boolean(b) => (*b).into(),
            AttributeValue::Integer(i) => (*i).into(),
            AttributeValue::Float(f) => (*f).into(),
            AttributeValue::String(s) => s.clone().into(),
            AttributeValue::Array(a) => a.iter().map(serde_json::Value::from).collect(),
        }
    }
}

/// Request-time description of the user being evaluated.
///
/// Private attributes take part in evaluation but are never serialized into events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs", default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: Attributes,
    #[serde(default, skip_serializing)]
    pub private_attributes: Attributes,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub statsig_environment: HashMap<String, String>,
}

impl User {
    /// Create a user identified by `user_id`.
    pub fn with_user_id(user_id: impl Into<String>) -> User {
        User {
            user_id: Some(user_id.into()),
            ..User::default()
        }
    }

    /// Create a user identified only by a custom id.
    pub fn with_custom_id(id_type: impl Into<String>, id: impl Into<String>) -> User {
        User {
            custom_ids: HashMap::from([(id_type.into(), id.into())]),
            ..User::default()
        }
    }

    /// Add a custom attribute.
    pub fn custom_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> User {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Add a private attribute.
    pub fn private_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> User {
        self.private_attributes.insert(key.into(), value.into());
        self
    }

    /// Return the id used for bucketing under `id_type`.
    ///
    /// `userID` (case-insensitive) selects the primary id, any other id type is looked up in
    /// custom ids first verbatim, then lowercased.
    pub fn get_unit_id(&self, id_type: &str) -> Option<&str> {
        if id_type.eq_ignore_ascii_case("userid") {
            return self.user_id.as_deref();
        }
        self.custom_ids
            .get(id_type)
            .or_else(|| self.custom_ids.get(&id_type.to_lowercase()))
            .map(String::as_str)
    }

    /// Look up a user field by name for condition evaluation.
    pub fn get_field(&self, field: &str) -> Option<AttributeValue> {
        let lowered = field.to_lowercase();
        let builtin = match lowered.as_str() {
            "userid" | "user_id" => &self.user_id,
            "email" => &self.email,
            "ip" => &self.ip,
            "useragent" | "user_agent" => &self.user_agent,
            "country" => &self.country,
            "locale" => &self.locale,
            "appversion" | "app_version" => &self.app_version,
            _ => &None,
        };
        if let Some(value) = builtin {
            return Some(AttributeValue::String(value.clone()));
        }

        [&self.custom, &self.private_attributes]
            .into_iter()
            .find_map(|attributes| attributes.get(field).or_else(|| attributes.get(&lowered)))
            .cloned()
    }

    /// Look up an environment field such as `tier`.
    pub fn get_environment_field(&self, field: &str) -> Option<AttributeValue> {
        self.statsig_environment
            .get(field)
            .or_else(|| self.statsig_environment.get(&field.to_lowercase()))
            .map(|v| AttributeValue::String(v.clone()))
    }

    /// Key under which persisted sticky values are stored for this user and id type.
    pub(crate) fn persistent_storage_key(&self, id_type: &str) -> Option<String> {
        self.get_unit_id(id_type)
            .map(|unit_id| format!("{unit_id}:{id_type}"))
    }
}
