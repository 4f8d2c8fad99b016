//! S3-backed durable store.
//!
//! Each logical path maps to an object key `{path}.json` holding one JSON
//! document. S3 has no push notifications at this layer, so `subscribe`
//! spawns a poll task per path that broadcasts the document whenever its
//! content changes. The task exits, and the channel entry is released, once
//! the last subscriber is gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::warn;

use super::DurableStore;

const CHANNEL_CAPACITY: usize = 64;

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>;

pub struct S3DurableStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    poll_interval: Duration,
    channels: ChannelMap,
}

impl S3DurableStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, poll_interval: Duration) -> Self {
        Self {
            client,
            bucket,
            poll_interval,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_for(path: &str) -> String {
        format!("{path}.json")
    }

    async fn fetch(
        client: &aws_sdk_s3::Client,
        bucket: &str,
        path: &str,
    ) -> anyhow::Result<Option<Value>> {
        let resp = match client
            .get_object()
            .bucket(bucket)
            .key(Self::key_for(path))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(err.into());
            }
        };
        let bytes = resp.body.collect().await?.into_bytes();
        let doc = serde_json::from_slice(&bytes)
            .with_context(|| format!("document at {path} is not valid JSON"))?;
        Ok(Some(doc))
    }
}

/// Broadcast the document at `path` on every content change until the last
/// receiver is dropped, then release the channel entry and stop.
async fn poll_document<F, Fut>(
    path: String,
    interval: Duration,
    channels: ChannelMap,
    tx: broadcast::Sender<Value>,
    fetch: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    let mut last_seen: Option<Value> = None;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        {
            // Checked under the map lock so a racing subscribe cannot grab
            // a sender this task is about to abandon.
            let mut map = channels.lock();
            if tx.receiver_count() == 0 {
                map.remove(&path);
                return;
            }
        }
        match fetch().await {
            Ok(Some(doc)) => {
                if last_seen.as_ref() != Some(&doc) {
                    last_seen = Some(doc.clone());
                    let _ = tx.send(doc);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path, error = %e, "durable store poll failed");
            }
        }
    }
}

#[async_trait]
impl DurableStore for S3DurableStore {
    async fn read(&self, path: &str) -> anyhow::Result<Option<Value>> {
        Self::fetch(&self.client, &self.bucket, path).await
    }

    async fn merge_write(&self, path: &str, fields: Map<String, Value>) -> anyhow::Result<()> {
        // Read-modify-write; relay writes carry full state, so a lost race
        // here is repaired by the next write.
        let mut doc = match self.read(path).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (k, v) in fields {
            doc.insert(k, v);
        }
        let bytes = serde_json::to_vec(&Value::Object(doc))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key_for(path))
            .content_type("application/json")
            .body(bytes.into())
            .send()
            .await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{path}/");
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .delimiter("/")
            .send()
            .await?;

        let mut children: Vec<String> = resp
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|name| name.strip_suffix(".json"))
            .map(str::to_string)
            .collect();
        children.extend(
            resp.common_prefixes()
                .iter()
                .filter_map(|p| p.prefix())
                .filter_map(|key| key.strip_prefix(&prefix))
                .filter_map(|name| name.strip_suffix('/'))
                .map(str::to_string),
        );
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(path) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(path.to_string(), tx.clone());

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let fetch_path = path.to_string();
        let fetch = move || {
            let client = client.clone();
            let bucket = bucket.clone();
            let path = fetch_path.clone();
            async move { S3DurableStore::fetch(&client, &bucket, &path).await }
        };
        tokio::spawn(poll_document(
            path.to_string(),
            self.poll_interval,
            self.channels.clone(),
            tx,
            fetch,
        ));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_broadcasts_content_changes_without_duplicates() {
        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = broadcast::channel(8);
        channels.lock().insert("Root/doc".to_string(), tx.clone());

        let doc = Arc::new(Mutex::new(serde_json::json!({ "rev": 1 })));
        let fetch_doc = doc.clone();
        tokio::spawn(poll_document(
            "Root/doc".into(),
            Duration::from_millis(10),
            channels,
            tx,
            move || {
                let doc = fetch_doc.lock().clone();
                async move { Ok(Some(doc)) }
            },
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.get("rev").unwrap(), 1);

        // Unchanged content is not re-broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        *doc.lock() = serde_json::json!({ "rev": 2 });
        let second = rx.recv().await.unwrap();
        assert_eq!(second.get("rev").unwrap(), 2);
    }

    #[tokio::test]
    async fn poll_task_exits_and_releases_channel_when_subscribers_leave() {
        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = broadcast::channel(8);
        channels.lock().insert("Root/doc".to_string(), tx.clone());

        let handle = tokio::spawn(poll_document(
            "Root/doc".into(),
            Duration::from_millis(10),
            channels.clone(),
            tx,
            || async { Ok(Some(serde_json::json!({ "rev": 1 }))) },
        ));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poll task kept running with no subscribers")
            .unwrap();
        assert!(!channels.lock().contains_key("Root/doc"));
    }
}
