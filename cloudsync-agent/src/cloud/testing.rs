//! In-memory object store for tests.

use super::{container_name, Container, ObjectStore};
use crate::model::Backup;
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put,
    Delete,
}

/// Records every operation; can fail or hold operations on demand
#[derive(Default)]
pub struct RecordingStore {
    ops: Mutex<Vec<(Op, String)>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_ops: AtomicBool,
    pub fail_containers: AtomicBool,
    pub containers_created: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Operations block until a permit is added to the returned semaphore
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (Arc::new(store), gate)
    }

    /// Operations take `delay` before completing
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn ops(&self) -> Vec<(Op, String)> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_ops.store(failing, Ordering::SeqCst);
    }

    async fn hold(&self) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| SyncError::Remote(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ops.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    fn provider(&self) -> &'static str {
        "recording"
    }

    async fn create_container(&self, backup: &Backup) -> Result<Container> {
        if self.fail_containers.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("container refused".into()));
        }
        self.containers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Container::new(&backup.name, container_name(&backup.name)))
    }

    async fn put(&self, _container: &Container, key: &str, source: &Path) -> Result<()> {
        self.ops.lock().unwrap().push((Op::Put, key.to_string()));
        self.hold().await?;
        let contents = tokio::fs::read(source).await?;
        self.objects.lock().unwrap().insert(key.to_string(), contents);
        Ok(())
    }

    async fn delete(&self, _container: &Container, key: &str) -> Result<()> {
        self.ops.lock().unwrap().push((Op::Delete, key.to_string()));
        self.hold().await?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
