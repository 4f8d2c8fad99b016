//! In-process durable store used by tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use super::DurableStore;

const CHANNEL_CAPACITY: usize = 64;

pub struct MemoryDurableStore {
    docs: Mutex<BTreeMap<String, Value>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    write_counts: Mutex<HashMap<String, usize>>,
    fail_writes: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            channels: Mutex::new(HashMap::new()),
            write_counts: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// When set, `merge_write` fails until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// How many acknowledged writes `path` has received.
    pub fn write_count(&self, path: &str) -> usize {
        self.write_counts.lock().get(path).copied().unwrap_or(0)
    }

    fn channel(&self, path: &str) -> broadcast::Sender<Value> {
        self.channels
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn read(&self, path: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.docs.lock().get(path).cloned())
    }

    async fn merge_write(&self, path: &str, fields: Map<String, Value>) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        let snapshot = {
            let mut docs = self.docs.lock();
            let doc = docs
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = doc {
                for (k, v) in fields {
                    map.insert(k, v);
                }
            }
            doc.clone()
        };
        *self.write_counts.lock().entry(path.to_string()).or_insert(0) += 1;
        let _ = self.channel(path).send(snapshot);
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{path}/");
        let docs = self.docs.lock();
        let mut children: Vec<String> = docs
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((first, _)) => first.to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<Value> {
        self.channel(path).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_write_preserves_unnamed_fields() {
        let store = MemoryDurableStore::new();
        let mut first = Map::new();
        first.insert("a".into(), Value::from(1));
        store.merge_write("Root/x", first).await.unwrap();

        let mut second = Map::new();
        second.insert("b".into(), Value::from(2));
        store.merge_write("Root/x", second).await.unwrap();

        let doc = store.read("Root/x").await.unwrap().unwrap();
        assert_eq!(doc.get("a").unwrap(), 1);
        assert_eq!(doc.get("b").unwrap(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_the_merged_document() {
        let store = MemoryDurableStore::new();
        let mut rx = store.subscribe("Root/x");
        let mut fields = Map::new();
        fields.insert("a".into(), Value::from(1));
        store.merge_write("Root/x", fields).await.unwrap();

        let doc = rx.recv().await.unwrap();
        assert_eq!(doc.get("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn list_dir_returns_immediate_children_only() {
        let store = MemoryDurableStore::new();
        for path in ["Root/m/t/h1", "Root/m/t/h2", "Root/m/other/h3"] {
            store.merge_write(path, Map::new()).await.unwrap();
        }
        assert_eq!(
            store.list_dir("Root/m/t").await.unwrap(),
            vec!["h1".to_string(), "h2".to_string()]
        );
        assert_eq!(
            store.list_dir("Root/m").await.unwrap(),
            vec!["other".to_string(), "t".to_string()]
        );
    }
}
