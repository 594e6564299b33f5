//! cas-server - content-addressed file storage over HTTP
//!
//! This crate provides:
//! - A sharded on-disk object store per digest algorithm (sha1, md5) with
//!   atomic, race-tolerant commits
//! - Streaming uploads verified against the declared digest and length
//! - Range-aware streaming downloads
//! - A background indexer that serves files already present in an external
//!   directory tree without copying them
//! - Per-channel admission control with daily quotas and deferred queueing

pub mod api;
pub mod config;
pub mod digest;
pub mod indexer;
pub mod object_store;
pub mod regulator;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Arc;

use config::Config;
use digest::Algorithm;
use indexer::Indexer;
use object_store::{LocalStore, ObjectStore};
use regulator::Regulator;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub indexer: Arc<Indexer>,
    pub regulator: Arc<Regulator>,
    pub stores: HashMap<Algorithm, Arc<dyn ObjectStore>>,
}

impl AppState {
    /// Open the storage root described by `config`: object directories,
    /// the index database and the indexer over the external tree.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = Database::open(config.storage.index_db_dir())?;
        let indexer = Arc::new(Indexer::new(
            &config.indexer.index_dir,
            db,
            config.indexer.exclude.clone(),
        )?);

        let mut stores: HashMap<Algorithm, Arc<dyn ObjectStore>> = HashMap::new();
        for algorithm in Algorithm::ALL {
            let mut store = LocalStore::new(config.storage.object_dir(algorithm), algorithm)?;
            if algorithm == indexer.algorithm() {
                store = store.with_index(Arc::clone(&indexer));
            }
            stores.insert(algorithm, Arc::new(store));
        }

        let regulator = Arc::new(Regulator::new(
            &config.channels,
            config.test_signature.clone(),
        ));

        Ok(Self {
            config,
            indexer,
            regulator,
            stores,
        })
    }

    pub fn store(&self, algorithm: Algorithm) -> Option<&Arc<dyn ObjectStore>> {
        self.stores.get(&algorithm)
    }
}
