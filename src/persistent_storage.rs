//! Storage for sticky assignments, so experiment allocation survives spec changes.
use std::{
    collections::HashMap,
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{eval::SecondaryExposure, Result};

/// Persisted outcome of one entity evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyValues {
    pub value: bool,
    #[serde(default)]
    pub json_value: Option<Map<String, Value>>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    /// Milliseconds since epoch when the value was persisted.
    pub time: u64,
    #[serde(default)]
    pub config_version: Option<u32>,
}

/// Sticky values of one user, keyed by entity name.
pub type UserPersistedValues = HashMap<String, StickyValues>;

/// Host-provided storage for sticky assignments.
///
/// Keys have the form `"{unit_id}:{id_type}"`. Failures are logged and evaluation falls back to
/// fresh bucketing.
pub trait PersistentStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<UserPersistedValues>>;

    fn save(&self, key: &str, entity: &str, values: StickyValues) -> Result<()>;

    fn delete(&self, key: &str, entity: &str) -> Result<()>;
}

/// A [`PersistentStorage`] backed by a map. Values live as long as the storage.
#[derive(Debug, Default)]
pub struct InMemoryPersistentStorage {
    values: RwLock<HashMap<String, UserPersistedValues>>,
}

impl InMemoryPersistentStorage {
    pub fn new() -> InMemoryPersistentStorage {
        InMemoryPersistentStorage::default()
    }
}

impl PersistentStorage for InMemoryPersistentStorage {
    fn load(&self, key: &str) -> Result<Option<UserPersistedValues>> {
        Ok(self
            .values
            .read()
            .ok()
            .and_then(|values| values.get(key).cloned()))
    }

    fn save(&self, key: &str, entity: &str, values: StickyValues) -> Result<()> {
        if let Ok(mut all) = self.values.write() {
            all.entry(key.to_owned())
                .or_default()
                .insert(entity.to_owned(), values);
        }
        Ok(())
    }

    fn delete(&self, key: &str, entity: &str) -> Result<()> {
        if let Ok(mut all) = self.values.write() {
            if let Some(user_values) = all.get_mut(key) {
                user_values.remove(entity);
                if user_values.is_empty() {
                    all.remove(key);
                }
            }
        }
        Ok(())
    }
}
