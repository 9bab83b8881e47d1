//! `SpecStore` holds the active specs snapshot and allows concurrent access for readers and
//! writers.
//!
//! Whenever specs change, the snapshot is replaced completely. A reader that gets a snapshot keeps
//! a consistent view for the whole evaluation, unaffected by later updates.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    eval::{EvaluationDetails, EvaluationReason},
    id_lists::IdList,
    specs::{IdListRef, SpecsResponse},
    specs_adapter::DataStore,
    Error, Result,
};

/// Where a specs snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecsSource {
    Uninitialized,
    /// Provided through [`EngineOptions::bootstrap_specs`](crate::EngineOptions).
    Bootstrap,
    /// Read from a local file.
    Cache,
    /// Downloaded from the specs endpoint.
    Network,
    /// Pushed by a data store or host-provided adapter.
    Adapter(String),
    Error,
}

impl fmt::Display for SpecsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecsSource::Uninitialized => f.write_str("Uninitialized"),
            SpecsSource::Bootstrap => f.write_str("Bootstrap"),
            SpecsSource::Cache => f.write_str("Cache"),
            SpecsSource::Network => f.write_str("Network"),
            SpecsSource::Adapter(name) => write!(f, "Adapter({name})"),
            SpecsSource::Error => f.write_str("Error"),
        }
    }
}

/// Version information adapters use to request deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecsInfo {
    pub lcut: Option<u64>,
    pub source: SpecsSource,
}

/// A raw payload pushed by an adapter.
#[derive(Debug, Clone)]
pub struct SpecsUpdate {
    pub data: String,
    pub source: SpecsSource,
    /// Milliseconds since epoch.
    pub received_at: u64,
}

/// The narrow contract adapters use to feed specs into the store.
pub trait SpecsUpdateListener: Send + Sync {
    /// Apply a payload. Errors are for the adapter's information and are never fatal.
    fn did_receive_specs_update(&self, update: SpecsUpdate) -> Result<()>;

    fn get_current_specs_info(&self) -> SpecsInfo;
}

/// An immutable, published view of the specs.
#[derive(Debug)]
pub struct SpecsSnapshot {
    pub values: Arc<SpecsResponse>,
    pub id_lists: Arc<HashMap<String, Arc<IdList>>>,
    pub source: SpecsSource,
    pub lcut: u64,
    pub received_at: u64,
}

pub struct SpecStore {
    snapshot: RwLock<Option<Arc<SpecsSnapshot>>>,
    /// Id lists maintained by the id-list syncer. Merged with inline lists of each payload.
    synced_id_lists: RwLock<Arc<HashMap<String, Arc<IdList>>>>,
    data_store: Option<(Arc<dyn DataStore>, String)>,
}

impl SpecStore {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            synced_id_lists: RwLock::new(Arc::new(HashMap::new())),
            data_store: None,
        }
    }

    /// Write network payloads through to `data_store` under `key`.
    pub(crate) fn with_data_store(mut self, data_store: Arc<dyn DataStore>, key: String) -> Self {
        self.data_store = Some((data_store, key));
        self
    }

    pub fn current_snapshot(&self) -> Option<Arc<SpecsSnapshot>> {
        // `.read()` fails only if a writer panicked while holding the lock, which should never
        // happen. Still, using `.ok()?` here to not crash the app.
        let snapshot = self.snapshot.read().ok()?;
        snapshot.clone()
    }

    pub fn current_specs_info(&self) -> SpecsInfo {
        match self.current_snapshot() {
            Some(snapshot) => SpecsInfo {
                lcut: Some(snapshot.lcut),
                source: snapshot.source.clone(),
            },
            None => SpecsInfo {
                lcut: None,
                source: SpecsSource::Uninitialized,
            },
        }
    }

    /// Parse `raw_payload` and publish it as the new snapshot.
    ///
    /// A payload with `has_updates: false` is a successful no-op. A payload whose `lcut` is not
    /// newer than the active snapshot is rejected with [`Error::StaleUpdate`]. On any error the
    /// prior snapshot stays active.
    pub fn apply(
        &self,
        raw_payload: &str,
        source: SpecsSource,
        received_at: u64,
    ) -> Result<EvaluationDetails> {
        let values: SpecsResponse = serde_json::from_str(raw_payload)
            .map_err(|err| Error::MalformedPayload(err.to_string()))?;

        if !values.has_updates {
            log::debug!(target: "switchyard", "specs payload from {source} has no updates");
            let current = self.current_snapshot();
            return Ok(EvaluationDetails::for_snapshot(
                current.as_deref(),
                EvaluationReason::Recognized,
            ));
        }

        let lcut = values
            .time
            .ok_or_else(|| Error::MalformedPayload("missing `time`".to_owned()))?;

        let inline_id_lists = inline_id_lists(&values);
        let values = Arc::new(values);

        let snapshot = {
            let mut slot = self
                .snapshot
                .write()
                .map_err(|_| Error::ThreadPanicked)?;
            // Read under the snapshot lock so a concurrent `set_id_lists` is never lost.
            let synced = self.synced_id_lists();

            if let Some(current) = slot.as_ref() {
                if lcut <= current.lcut {
                    return Err(Error::StaleUpdate {
                        current_lcut: current.lcut,
                        incoming_lcut: lcut,
                    });
                }
            }

            let snapshot = Arc::new(SpecsSnapshot {
                values,
                id_lists: merge_id_lists(&synced, inline_id_lists),
                source: source.clone(),
                lcut,
                received_at,
            });
            *slot = Some(snapshot.clone());
            snapshot
        };

        log::debug!(target: "switchyard", lcut; "applied new specs from {source}");

        if source == SpecsSource::Network {
            self.write_through(raw_payload, received_at);
        }

        Ok(EvaluationDetails::for_snapshot(
            Some(&snapshot),
            EvaluationReason::Recognized,
        ))
    }

    /// Id lists currently maintained by the id-list syncer.
    pub(crate) fn synced_id_lists(&self) -> Arc<HashMap<String, Arc<IdList>>> {
        self.synced_id_lists
            .read()
            .map(|lists| lists.clone())
            .unwrap_or_default()
    }

    /// Replace the synced id lists and publish a snapshot sharing the current spec maps.
    pub(crate) fn set_id_lists(&self, id_lists: HashMap<String, Arc<IdList>>) {
        let id_lists = Arc::new(id_lists);
        if let Ok(mut synced) = self.synced_id_lists.write() {
            *synced = id_lists.clone();
        }

        let Ok(mut slot) = self.snapshot.write() else {
            return;
        };
        if let Some(current) = slot.as_ref() {
            let inline = inline_id_lists(&current.values);
            *slot = Some(Arc::new(SpecsSnapshot {
                values: current.values.clone(),
                id_lists: merge_id_lists(&id_lists, inline),
                source: current.source.clone(),
                lcut: current.lcut,
                received_at: current.received_at,
            }));
        }
    }

    fn write_through(&self, raw_payload: &str, received_at: u64) {
        let Some((data_store, key)) = &self.data_store else {
            return;
        };
        if let Err(err) = data_store.set(key, raw_payload, Some(received_at)) {
            log::warn!(target: "switchyard", "failed to write specs to data store: {err}");
        }
    }
}

impl Default for SpecStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecsUpdateListener for SpecStore {
    fn did_receive_specs_update(&self, update: SpecsUpdate) -> Result<()> {
        match self.apply(&update.data, update.source, update.received_at) {
            Ok(_) => Ok(()),
            Err(err @ Error::StaleUpdate { .. }) => {
                log::debug!(target: "switchyard", "ignoring specs update: {err}");
                Err(err)
            }
            Err(err) => {
                log::warn!(target: "switchyard", "failed to apply specs update: {err}");
                Err(err)
            }
        }
    }

    fn get_current_specs_info(&self) -> SpecsInfo {
        self.current_specs_info()
    }
}

fn inline_id_lists(values: &SpecsResponse) -> Vec<IdList> {
    values
        .id_lists
        .iter()
        .filter_map(|(name, list)| match list {
            IdListRef::Inline(ids) => Some(IdList::from_hashed_ids(name, ids.iter().cloned())),
            IdListRef::Declared(_) => None,
        })
        .collect()
}

fn merge_id_lists(
    synced: &HashMap<String, Arc<IdList>>,
    inline: Vec<IdList>,
) -> Arc<HashMap<String, Arc<IdList>>> {
    if inline.is_empty() {
        return Arc::new(synced.clone());
    }
    let mut merged = synced.clone();
    for list in inline {
        merged.insert(list.metadata.name.clone(), Arc::new(list));
    }
    Arc::new(merged)
}
