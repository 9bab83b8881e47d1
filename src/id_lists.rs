//! Id lists (segments) and the background syncer that keeps them up to date.
//!
//! The manifest endpoint returns metadata for every list. Each list file is a sequence of
//! `+<hashed id>` / `-<hashed id>` lines that is downloaded incrementally with a `Range` header.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use reqwest::{header::HeaderMap, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::{
    poller::{PollOutcome, PollerConfig, PollerThread},
    spec_store::SpecStore,
    Error, Result,
};

pub const DEFAULT_ID_LISTS_URL: &str = "https://statsigapi.net/v1/get_id_lists";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdListMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "fileID", default)]
    pub file_id: Option<String>,
    /// Size of the list file in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub creation_time: i64,
}

/// A named set of hashed ids.
#[derive(Debug, Clone, Default)]
pub struct IdList {
    pub metadata: IdListMetadata,
    ids: HashSet<String>,
    /// Number of bytes of the list file applied so far.
    read_bytes: u64,
}

impl IdList {
    pub fn new(metadata: IdListMetadata) -> IdList {
        IdList {
            metadata,
            ids: HashSet::new(),
            read_bytes: 0,
        }
    }

    /// Build a list from ids that are already hashed with
    /// [`id_list_hash`](crate::sharder::id_list_hash).
    pub fn from_hashed_ids<I, S>(name: &str, ids: I) -> IdList
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: HashSet<String> = ids.into_iter().map(Into::into).collect();
        IdList {
            metadata: IdListMetadata {
                name: name.to_owned(),
                size: ids.len() as u64,
                ..IdListMetadata::default()
            },
            ids,
            read_bytes: 0,
        }
    }

    pub fn contains_hashed(&self, hashed_id: &str) -> bool {
        self.ids.contains(hashed_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Apply a chunk of `+id`/`-id` lines. Lines without a prefix are ignored.
    pub fn apply_changes(&mut self, changes: &str) {
        for line in changes.lines() {
            let line = line.trim();
            if let Some(id) = line.strip_prefix('+') {
                self.ids.insert(id.to_owned());
            } else if let Some(id) = line.strip_prefix('-') {
                self.ids.remove(id);
            }
        }
        self.read_bytes += changes.len() as u64;
    }
}

/// Periodically downloads id lists and publishes them to the [`SpecStore`].
pub(crate) struct IdListsSyncer {
    client: reqwest::blocking::Client,
    manifest_url: Url,
    headers: HeaderMap,
    store: Arc<SpecStore>,
    interval: Duration,
    poller: Mutex<Option<PollerThread>>,
}

impl IdListsSyncer {
    pub fn new(
        client: reqwest::blocking::Client,
        manifest_url: Url,
        headers: HeaderMap,
        store: Arc<SpecStore>,
        interval: Duration,
    ) -> IdListsSyncer {
        IdListsSyncer {
            client,
            manifest_url,
            headers,
            store,
            interval,
            poller: Mutex::new(None),
        }
    }

    /// Run one sync: fetch the manifest, download what changed and publish the result.
    pub fn sync(&self) -> Result<()> {
        let manifest = self.fetch_manifest()?;
        let current = self.store.synced_id_lists();

        let mut updated = HashMap::with_capacity(manifest.len());
        for (name, mut metadata) in manifest {
            if metadata.name.is_empty() {
                metadata.name = name.clone();
            }

            let mut list = match current.get(&name) {
                Some(existing)
                    if existing.metadata.file_id == metadata.file_id
                        && metadata.creation_time <= existing.metadata.creation_time =>
                {
                    if metadata.size <= existing.read_bytes {
                        updated.insert(name, existing.clone());
                        continue;
                    }
                    IdList::clone(existing)
                }
                // A new file replaces the list from scratch.
                _ => IdList::new(metadata.clone()),
            };

            match self.fetch_list_changes(&metadata.url, list.read_bytes) {
                Ok(changes) => {
                    list.apply_changes(&changes);
                    list.metadata = metadata;
                    updated.insert(name, Arc::new(list));
                }
                Err(err) => {
                    log::warn!(target: "switchyard", "failed to download id list {name}: {err}");
                    if let Some(existing) = current.get(&name) {
                        updated.insert(name, existing.clone());
                    }
                }
            }
        }

        log::debug!(target: "switchyard", count = updated.len(); "synced id lists");
        self.store.set_id_lists(updated);
        Ok(())
    }

    pub fn start_background_sync(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let poller = PollerThread::start(
            "switchyard-id-lists",
            PollerConfig::new(self.interval),
            move || {
                let Some(syncer) = weak.upgrade() else {
                    return PollOutcome::Stop;
                };
                match syncer.sync() {
                    Ok(()) => PollOutcome::Continue,
                    Err(Error::Unauthorized) => PollOutcome::Stop,
                    Err(err) => {
                        log::warn!(target: "switchyard", "id list sync failed: {err}");
                        PollOutcome::Failed
                    }
                }
            },
        )?;

        if let Ok(mut slot) = self.poller.lock() {
            if let Some(previous) = slot.replace(poller) {
                previous.stop();
            }
        }
        Ok(())
    }

    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let poller = self.poller.lock().ok().and_then(|mut slot| slot.take());
        match poller {
            Some(poller) => poller.shutdown(timeout),
            None => Ok(()),
        }
    }

    fn fetch_manifest(&self) -> Result<HashMap<String, IdListMetadata>> {
        log::debug!(target: "switchyard", "fetching id list manifest");
        let response = self
            .client
            .post(self.manifest_url.clone())
            .headers(self.headers.clone())
            .json(&serde_json::json!({}))
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "switchyard", "id list request is not authorized. Check your sdk key");
                Err(Error::Unauthorized)
            }
            status if status.is_success() => {
                let body = response.text()?;
                serde_json::from_str(&body).map_err(|err| Error::MalformedPayload(err.to_string()))
            }
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }

    fn fetch_list_changes(&self, url: &str, range_start: u64) -> Result<String> {
        let url = Url::parse(url)?;
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .header(reqwest::header::RANGE, format!("bytes={range_start}-"))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }
        Ok(response.text()?)
    }
}
