//! Replication Driver (4.K): consumes a source list snapshot and converges
//! the local type to it, diffing by `id` under the internal-replication
//! context so creates preserve the source's `id`/`generation` instead of
//! being assigned fresh ones.

use crate::context::RequestContext;
use crate::error::Error;
use crate::filter::ListOpts;
use crate::json;
use crate::metadata::Record;
use crate::pipeline::Pipeline;
use crate::read::Reader;
use crate::registry::TypeConfig;
use reflecta_store::RecordStore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ReplicationDriver<T: Record> {
    pipeline: Pipeline<T>,
    reader: Reader<T>,
}

impl<T: Record> ReplicationDriver<T> {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<TypeConfig<T>>) -> Self {
        ReplicationDriver {
            pipeline: Pipeline::new(store.clone(), config.clone()),
            reader: Reader::new(store, config),
        }
    }

    /// Converges the local type to one snapshot from the source's
    /// list-stream: unknown ids are created, known ids whose `etag` differs
    /// are patched, and locally present ids absent from `source` are
    /// deleted. Runs under `RequestContext::internal_replication()`, which
    /// bypasses the normal id/generation overwrite on create (4.C) but still
    /// runs any server-side capability checks registered for the type.
    pub async fn converge(&self, source: &[Value]) -> Result<(), Error> {
        let ctx = RequestContext::internal_replication();

        let local_list = self.reader.list(&ctx, ListOpts::default()).await?.items.unwrap_or_default();
        let mut local_by_id: HashMap<String, Value> = HashMap::with_capacity(local_list.len());
        for item in local_list {
            if let Some(id) = item.get("id").and_then(Value::as_str) {
                local_by_id.insert(id.to_string(), item);
            }
        }

        let mut seen = HashSet::with_capacity(source.len());

        for source_item in source {
            let Some(id) = source_item.get("id").and_then(Value::as_str).map(String::from) else {
                warn!("replication source item missing id, skipping");
                continue;
            };
            seen.insert(id.clone());

            match local_by_id.get(&id) {
                None => {
                    let record: T = json::from_value(source_item.clone())?;
                    self.pipeline.create(&ctx, record).await?;
                    debug!(id, "replicated create");
                }
                Some(local_item) => {
                    let source_etag = source_item.get("etag").and_then(Value::as_str).unwrap_or_default();
                    let local_etag = local_item.get("etag").and_then(Value::as_str).unwrap_or_default();
                    if source_etag != local_etag {
                        let mut patch = source_item.clone();
                        if let Some(obj) = patch.as_object_mut() {
                            obj.remove("id");
                            obj.remove("etag");
                            obj.remove("generation");
                        }
                        self.pipeline.update(&ctx, &id, patch, None).await?;
                        debug!(id, "replicated update");
                    }
                }
            }
        }

        for id in local_by_id.keys() {
            if !seen.contains(id) {
                self.pipeline.delete(&ctx, id, None).await?;
                debug!(id, "replicated delete");
            }
        }

        Ok(())
    }
}
