//! Sources of specs payloads.
//!
//! An adapter obtains raw payloads and pushes them into the [`SpecStore`](crate::SpecStore)
//! through [`SpecsUpdateListener`]. It never parses payloads itself.
use std::{sync::Arc, time::Duration};

use crate::{spec_store::SpecsUpdateListener, Result};

mod data_store;
mod function;
mod http;
mod local_file;

pub use data_store::{DataStore, DataStoreSpecsAdapter};
pub use function::{FunctionSpecsAdapter, SpecsPushHandle};
pub use http::{HttpSpecsAdapter, DEFAULT_SPECS_URL};
pub use local_file::LocalFileSpecsAdapter;

pub(crate) use data_store::data_store_key;
pub(crate) use http::SpecsFetcher;

/// Capability set of a specs source.
pub trait SpecsAdapter: Send + Sync {
    /// Obtain the initial payload and push it to `listener`.
    ///
    /// Called once, from a background thread. The listener must be kept for background syncs.
    fn start(&self, listener: Arc<dyn SpecsUpdateListener>) -> Result<()>;

    /// Begin periodic refresh, if the adapter supports it.
    fn schedule_background_sync(&self) -> Result<()>;

    /// Stop background work, waiting up to `timeout`.
    fn shutdown(&self, timeout: Duration) -> Result<()>;

    fn type_name(&self) -> String;
}

/// Adapter used when the network is disabled and no other adapter is configured.
pub struct NoopSpecsAdapter;

impl SpecsAdapter for NoopSpecsAdapter {
    fn start(&self, _listener: Arc<dyn SpecsUpdateListener>) -> Result<()> {
        Ok(())
    }

    fn schedule_background_sync(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn type_name(&self) -> String {
        "NoopSpecsAdapter".to_owned()
    }
}
