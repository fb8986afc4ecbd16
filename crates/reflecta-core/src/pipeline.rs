//! Write Pipeline: Create/Replace/Update/Delete, with precondition matching,
//! clone-then-mutate, generation bump, and store write — all under the
//! per-ID lock for the three mutating operations.

use crate::condition::check_if_match;
use crate::context::RequestContext;
use crate::error::Error;
use crate::json;
use crate::metadata::{content_etag, new_id, Record};
use crate::path;
use crate::registry::TypeConfig;
use reflecta_store::RecordStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Pipeline<T: Record> {
    store: Arc<dyn RecordStore>,
    config: Arc<TypeConfig<T>>,
}

impl<T: Record> Pipeline<T> {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<TypeConfig<T>>) -> Self {
        Pipeline { store, config }
    }

    pub fn config(&self) -> &Arc<TypeConfig<T>> {
        &self.config
    }

    pub async fn create(&self, ctx: &RequestContext, record: T) -> Result<T, Error> {
        let mut value = json::to_value(&record)?;

        if !ctx.is_internal_replication() {
            set_field(&mut value, "id", Value::String(new_id()));
            set_field(&mut value, "generation", Value::from(1u64));
        }

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_request("record has no id"))?
            .to_string();

        stamp_etag(&mut value);
        self.config.check_write(ctx, Some(&mut value), None)?;
        stamp_etag(&mut value);

        self.store
            .write(&self.config.api_name, &id, value.clone())
            .await
            .map_err(|e| Error::from(e).with_context("create failed"))?;

        debug!(id, "created record");

        if !self.config.check_read(ctx, &value)? {
            return Err(Error::forbidden("created record is not visible to caller"));
        }

        json::from_value(value)
    }

    pub async fn replace(
        &self,
        ctx: &RequestContext,
        id: &str,
        record: T,
        if_match: Option<&str>,
    ) -> Result<T, Error> {
        let _guard = self.config.locks.acquire(id).await;

        let prev = self.read_required(id).await?;
        let (prev_etag, prev_generation) = etag_and_generation(&prev);
        check_if_match(if_match, &prev_etag, prev_generation)?;

        let mut value = json::to_value(&record)?;
        set_field(&mut value, "id", Value::String(id.to_string()));
        set_field(&mut value, "generation", Value::from(prev_generation + 1));

        stamp_etag(&mut value);
        self.config.check_write(ctx, Some(&mut value), Some(&prev))?;
        stamp_etag(&mut value);

        self.store
            .write(&self.config.api_name, id, value.clone())
            .await
            .map_err(|e| Error::from(e).with_context("replace failed"))?;

        if !self.config.check_read(ctx, &value)? {
            return Err(Error::forbidden("replaced record is not visible to caller"));
        }

        json::from_value(value)
    }

    /// `patch` maps field paths (possibly dotted) to new values. The keys
    /// `id`, `etag`, and `generation` are stripped before the merge, matching
    /// 4.C.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: &str,
        mut patch: Value,
        if_match: Option<&str>,
    ) -> Result<T, Error> {
        let patch_obj = patch
            .as_object_mut()
            .ok_or_else(|| Error::bad_request("patch body must be a JSON object"))?;
        patch_obj.remove("id");
        patch_obj.remove("etag");
        patch_obj.remove("generation");
        let patch_obj = patch_obj.clone();

        let _guard = self.config.locks.acquire(id).await;

        let prev = self.read_required(id).await?;
        let (prev_etag, prev_generation) = etag_and_generation(&prev);
        check_if_match(if_match, &prev_etag, prev_generation)?;

        let mut value = prev.clone();
        for (k, v) in patch_obj {
            path::set(&mut value, &k, v);
        }
        set_field(&mut value, "id", Value::String(id.to_string()));
        set_field(&mut value, "generation", Value::from(prev_generation + 1));

        stamp_etag(&mut value);
        self.config.check_write(ctx, Some(&mut value), Some(&prev))?;
        stamp_etag(&mut value);

        self.store
            .write(&self.config.api_name, id, value.clone())
            .await
            .map_err(|e| Error::from(e).with_context("update failed"))?;

        if !self.config.check_read(ctx, &value)? {
            return Err(Error::forbidden("updated record is not visible to caller"));
        }

        json::from_value(value)
    }

    pub async fn delete(&self, ctx: &RequestContext, id: &str, if_match: Option<&str>) -> Result<(), Error> {
        let _guard = self.config.locks.acquire(id).await;

        let prev = self.read_required(id).await?;
        let (prev_etag, prev_generation) = etag_and_generation(&prev);
        check_if_match(if_match, &prev_etag, prev_generation)?;

        self.config.check_write(ctx, None, Some(&prev))?;

        self.store
            .delete(&self.config.api_name, id)
            .await
            .map_err(|e| Error::from(e).with_context("delete failed"))?;

        debug!(id, "deleted record");
        Ok(())
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<Option<T>, Error> {
        let Some(value) = self
            .store
            .read(&self.config.api_name, id)
            .await
            .map_err(Error::from)?
        else {
            return Ok(None);
        };
        if !self.config.check_read(ctx, &value)? {
            return Err(Error::forbidden(format!("{id} is not visible to caller")));
        }
        Ok(Some(json::from_value(value)?))
    }

    async fn read_required(&self, id: &str) -> Result<Value, Error> {
        self.store
            .read(&self.config.api_name, id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found(format!("{id} not found")))
    }
}

fn set_field(value: &mut Value, key: &str, v: Value) {
    if !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }
    value.as_object_mut().expect("just ensured object").insert(key.to_string(), v);
}

fn stamp_etag(value: &mut Value) {
    let tag = content_etag(value);
    set_field(value, "etag", Value::String(tag));
}

fn etag_and_generation(value: &Value) -> (String, u64) {
    let etag = value.get("etag").and_then(Value::as_str).unwrap_or_default().to_string();
    let generation = value.get("generation").and_then(Value::as_u64).unwrap_or(0);
    (etag, generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use facet::Facet;
    use reflecta_store::MemoryStore;

    #[derive(Facet, Clone, Debug, PartialEq)]
    struct Widget {
        id: String,
        generation: u64,
        etag: String,
        text: String,
    }

    impl Record for Widget {
        fn metadata(&self) -> Metadata {
            Metadata { id: self.id.clone(), generation: self.generation, etag: self.etag.clone() }
        }
        fn set_metadata(&mut self, m: Metadata) {
            self.id = m.id;
            self.generation = m.generation;
            self.etag = m.etag;
        }
    }

    fn pipeline() -> Pipeline<Widget> {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(TypeConfig::new("widget"));
        Pipeline::new(store, config)
    }

    #[tokio::test]
    async fn create_assigns_fresh_id_and_generation_one() {
        let p = pipeline();
        let w = Widget { id: "ignored".into(), generation: 99, etag: "ignored".into(), text: "foo".into() };
        let created = p.create(&RequestContext::anonymous(), w).await.unwrap();
        assert_eq!(created.generation, 1);
        assert_ne!(created.id, "ignored");
        assert!(!created.etag.is_empty());
    }

    #[tokio::test]
    async fn update_bumps_generation_and_merges_patch() {
        let p = pipeline();
        let created = p
            .create(&RequestContext::anonymous(), Widget { id: "x".into(), generation: 0, etag: "".into(), text: "foo".into() })
            .await
            .unwrap();

        let patch = serde_json::json!({"text": "bar"});
        let updated = p
            .update(&RequestContext::anonymous(), &created.id, patch, None)
            .await
            .unwrap();

        assert_eq!(updated.generation, 2);
        assert_eq!(updated.text, "bar");
        assert_ne!(updated.etag, created.etag);
    }

    #[tokio::test]
    async fn replace_with_mismatched_if_match_is_412_and_unchanged() {
        let p = pipeline();
        let created = p
            .create(&RequestContext::anonymous(), Widget { id: "x".into(), generation: 0, etag: "".into(), text: "foo".into() })
            .await
            .unwrap();

        let err = p
            .replace(
                &RequestContext::anonymous(),
                &created.id,
                Widget { id: "x".into(), generation: 0, etag: "".into(), text: "bar".into() },
                Some("\"wrong-etag\""),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 412);

        let still = p.get(&RequestContext::anonymous(), &created.id).await.unwrap().unwrap();
        assert_eq!(still.text, "foo");
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let p = pipeline();
        let created = p
            .create(&RequestContext::anonymous(), Widget { id: "x".into(), generation: 0, etag: "".into(), text: "foo".into() })
            .await
            .unwrap();
        p.delete(&RequestContext::anonymous(), &created.id, None).await.unwrap();
        assert!(p.get(&RequestContext::anonymous(), &created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generation_strictly_increases_across_writes() {
        let p = pipeline();
        let created = p
            .create(&RequestContext::anonymous(), Widget { id: "x".into(), generation: 0, etag: "".into(), text: "foo".into() })
            .await
            .unwrap();
        let mut last_gen = created.generation;
        for i in 0..5 {
            let updated = p
                .update(&RequestContext::anonymous(), &created.id, serde_json::json!({"text": format!("v{i}")}), None)
                .await
                .unwrap();
            assert!(updated.generation > last_gen);
            last_gen = updated.generation;
        }
    }
}
