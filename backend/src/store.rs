use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store unavailable")]
    Unavailable,
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn new_key(&self) -> String;

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the subtree at `path`. Writing `null` removes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    fn subscribe(&self, path: &str) -> broadcast::Receiver<Option<Value>>;
}

/// Runs a store operation, giving up with [`StoreError::Unavailable`] after `limit`.
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| StoreError::Unavailable)?
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn related(a: &[&str], b: &[&str]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn lookup<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(tree, |node, seg| node.get(*seg))
}

fn write(tree: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return;
    };

    let mut node = tree;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    tree: RwLock<Value>,
    watchers: Mutex<HashMap<String, broadcast::Sender<Option<Value>>>>,
    persist_path: Option<PathBuf>,
    seq: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::build(Value::Object(Map::new()), None)
    }
}

impl MemoryStore {
    fn build(tree: Value, persist_path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(tree),
                watchers: Mutex::new(HashMap::new()),
                persist_path,
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tree = Value::Object(Map::new());
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(saved) if saved.is_object() => tree = saved,
                Ok(_) => tracing::warn!(path = %path.display(), "ignoring non-object store file"),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "unreadable store file"),
            }
        }
        Self::build(tree, Some(path))
    }

    async fn persist(&self, tree: &Value) -> Result<(), StoreError> {
        if let Some(path) = &self.inner.persist_path {
            let json = serde_json::to_vec_pretty(tree)?;
            tokio::fs::write(path, json).await?;
        }
        Ok(())
    }

    fn notify(&self, tree: &Value, written: &[&str]) {
        let Ok(mut watchers) = self.inner.watchers.lock() else {
            return;
        };
        watchers.retain(|_, tx| tx.receiver_count() > 0);
        for (path, tx) in watchers.iter() {
            let watched = segments(path);
            if related(&watched, written) {
                let _ = tx.send(lookup(tree, &watched).cloned());
            }
        }
    }

    async fn write_many(&self, base: &str, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        let base = segments(base);
        let mut tree = self.inner.tree.write().await;
        for (child, value) in entries {
            let mut path = base.clone();
            path.extend(segments(&child));
            write(&mut tree, &path, value);
        }
        self.persist(&tree).await?;
        self.notify(&tree, &base);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn new_key(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();
        format!("{millis:012x}{seq:08x}{suffix}")
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let key = self.new_key();
        self.write_many(path, vec![(key.clone(), value)]).await?;
        Ok(key)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let tree = self.inner.tree.read().await;
        Ok(lookup(&tree, &segments(path)).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.write_many(path, vec![(String::new(), value)]).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.write_many(path, fields.into_iter().collect()).await
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<Option<Value>> {
        let key = segments(path).join("/");
        match self.inner.watchers.lock() {
            Ok(mut watchers) => watchers
                .entry(key)
                .or_insert_with(|| broadcast::channel(32).0)
                .subscribe(),
            // A poisoned registry only loses the live feed.
            Err(_) => broadcast::channel(1).1,
        }
    }
}
