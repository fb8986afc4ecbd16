use crate::{ReadStreamHandle, RecordStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace};

const OBJECT_CHANNEL_CAPACITY: usize = 256;
const OBJECT_STREAM_BUFFER: usize = 16;

#[derive(Clone, Debug)]
enum ObjectEvent {
    Updated(Value),
    Deleted,
}

struct Bucket {
    items: DashMap<String, Value>,
    list_tx: watch::Sender<Vec<Value>>,
    object_tx: broadcast::Sender<(String, ObjectEvent)>,
}

impl Bucket {
    fn new() -> Self {
        let (list_tx, _) = watch::channel(Vec::new());
        let (object_tx, _) = broadcast::channel(OBJECT_CHANNEL_CAPACITY);
        Bucket {
            items: DashMap::new(),
            list_tx,
            object_tx,
        }
    }

    fn publish_list(&self) {
        let snapshot: Vec<Value> = self.items.iter().map(|e| e.value().clone()).collect();
        // No subscribers is fine; watch::Sender::send only errors when every
        // receiver (including our own retained one) has been dropped, which
        // can't happen since the bucket always holds one via list_tx.
        let _ = self.list_tx.send(snapshot);
    }
}

/// In-process implementation of [`RecordStore`], backing the demo binary and
/// the integration test suite. Not durable: state is lost on process exit.
pub struct MemoryStore {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, name: &str) -> Arc<Bucket> {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bucket::new()))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, bucket: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let bucket = self.bucket(bucket);
        Ok(bucket.items.get(id).map(|e| e.value().clone()))
    }

    async fn write(&self, bucket_name: &str, id: &str, value: Value) -> Result<(), StoreError> {
        let bucket = self.bucket(bucket_name);
        bucket.items.insert(id.to_string(), value.clone());
        let _ = bucket
            .object_tx
            .send((id.to_string(), ObjectEvent::Updated(value)));
        bucket.publish_list();
        trace!(bucket = bucket_name, id, "wrote record");
        Ok(())
    }

    async fn delete(&self, bucket_name: &str, id: &str) -> Result<(), StoreError> {
        let bucket = self.bucket(bucket_name);
        if bucket.items.remove(id).is_none() {
            return Err(StoreError::NotFound {
                bucket: bucket_name.to_string(),
                id: id.to_string(),
            });
        }
        let _ = bucket.object_tx.send((id.to_string(), ObjectEvent::Deleted));
        bucket.publish_list();
        debug!(bucket = bucket_name, id, "deleted record");
        Ok(())
    }

    async fn list(&self, bucket: &str) -> Result<Vec<Value>, StoreError> {
        let bucket = self.bucket(bucket);
        Ok(bucket.items.iter().map(|e| e.value().clone()).collect())
    }

    async fn read_stream(&self, bucket_name: &str, id: &str) -> Result<ReadStreamHandle, StoreError> {
        let bucket = self.bucket(bucket_name);
        let mut brx = bucket.object_tx.subscribe();
        let current = bucket.items.get(id).map(|e| e.value().clone());
        let id = id.to_string();

        let (tx, rx) = mpsc::channel(OBJECT_STREAM_BUFFER);

        let guard = tokio::spawn(async move {
            if let Some(v) = current {
                if tx.send(v).await.is_err() {
                    return;
                }
            }

            loop {
                match brx.recv().await {
                    Ok((eid, ObjectEvent::Updated(v))) if eid == id => {
                        if tx.send(v).await.is_err() {
                            return;
                        }
                    }
                    Ok((eid, ObjectEvent::Deleted)) if eid == id => {
                        // Dropping `tx` here closes the channel, which the
                        // consumer reads as end-of-stream ("delete, close").
                        return;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(ReadStreamHandle { rx, _guard: guard })
    }

    async fn list_stream(&self, bucket_name: &str) -> Result<crate::ListStreamHandle, StoreError> {
        let bucket = self.bucket(bucket_name);
        // Make sure the channel reflects the current contents even if this
        // is the bucket's first subscriber and no write has happened yet.
        bucket.publish_list();
        Ok(crate::ListStreamHandle {
            rx: bucket.list_tx.subscribe(),
            primed: false,
        })
    }
}
