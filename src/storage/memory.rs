//! In-memory bucket backend
//!
//! Records every call so tests can assert on idempotence, and lets them
//! inject failures. Clones share state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::storage::{
    BucketApi, BucketApiFactory, BucketEndpoint, BucketLocation, CreateOutcome, Hardening,
    StorageCredentials, StorageError, StorageResult,
};

/// A bucket held in memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBucket {
    pub region: String,
    /// Owned by the credentials the operator uses
    pub owned: bool,
    pub hardening: Option<Hardening>,
}

/// Call counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub locate: usize,
    pub create: usize,
    pub harden: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.connect + self.locate + self.create + self.harden
    }
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, MemoryBucket>,
    calls: CallCounts,
    endpoints: Vec<BucketEndpoint>,
    fail_connect: Option<StorageError>,
    fail_create: Option<StorageError>,
    fail_harden: Option<StorageError>,
}

/// In-memory [`BucketApiFactory`] and [`BucketApi`]
#[derive(Clone, Debug, Default)]
pub struct MemoryBuckets {
    state: Arc<Mutex<State>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a bucket owned by the operator's credentials
    pub fn with_owned_bucket(self, name: &str, region: &str) -> Self {
        self.insert(name, region, true);
        self
    }

    /// Seed a bucket owned by somebody else
    pub fn with_foreign_bucket(self, name: &str, region: &str) -> Self {
        self.insert(name, region, false);
        self
    }

    fn insert(&self, name: &str, region: &str, owned: bool) {
        self.state().buckets.insert(
            name.to_string(),
            MemoryBucket {
                region: region.to_string(),
                owned,
                hardening: None,
            },
        );
    }

    pub fn fail_next_connect(&self, error: StorageError) {
        self.state().fail_connect = Some(error);
    }

    pub fn fail_next_create(&self, error: StorageError) {
        self.state().fail_create = Some(error);
    }

    pub fn fail_next_harden(&self, error: StorageError) {
        self.state().fail_harden = Some(error);
    }

    pub fn bucket(&self, name: &str) -> Option<MemoryBucket> {
        self.state().buckets.get(name).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.state().buckets.keys().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls.clone()
    }

    /// Endpoints passed to `connect`, in order
    pub fn endpoints(&self) -> Vec<BucketEndpoint> {
        self.state().endpoints.clone()
    }
}

#[async_trait]
impl BucketApiFactory for MemoryBuckets {
    async fn connect(
        &self,
        endpoint: &BucketEndpoint,
        credentials: &StorageCredentials,
    ) -> StorageResult<Box<dyn BucketApi>> {
        let mut state = self.state();
        state.calls.connect += 1;
        state.endpoints.push(endpoint.clone());
        if let Some(error) = state.fail_connect.take() {
            return Err(error);
        }
        if *credentials == StorageCredentials::None {
            return Err(StorageError::Authentication(
                "no credentials supplied".to_string(),
            ));
        }
        drop(state);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl BucketApi for MemoryBuckets {
    async fn locate(&self, name: &str) -> StorageResult<BucketLocation> {
        let mut state = self.state();
        state.calls.locate += 1;
        Ok(match state.buckets.get(name) {
            Some(bucket) if bucket.owned => BucketLocation::Exists {
                region: Some(bucket.region.clone()),
            },
            Some(_) => BucketLocation::Forbidden,
            None => BucketLocation::Missing,
        })
    }

    async fn create(&self, name: &str, region: &str) -> StorageResult<CreateOutcome> {
        let mut state = self.state();
        state.calls.create += 1;
        if let Some(error) = state.fail_create.take() {
            return Err(error);
        }
        match state.buckets.get(name) {
            Some(bucket) if bucket.owned => Ok(CreateOutcome::AlreadyOwned),
            Some(_) => Err(StorageError::Configuration(format!(
                "bucket name {} is taken by another account",
                name
            ))),
            None => {
                state.buckets.insert(
                    name.to_string(),
                    MemoryBucket {
                        region: region.to_string(),
                        owned: true,
                        hardening: None,
                    },
                );
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn harden(&self, name: &str, hardening: &Hardening) -> StorageResult<()> {
        let mut state = self.state();
        state.calls.harden += 1;
        if let Some(error) = state.fail_harden.take() {
            return Err(error);
        }
        match state.buckets.get_mut(name) {
            Some(bucket) => {
                bucket.hardening = Some(hardening.clone());
                Ok(())
            }
            None => Err(StorageError::Configuration(format!(
                "bucket {} does not exist",
                name
            ))),
        }
    }
}
