//! Read & List (4.F): single-object and list reads, wired to filter/sort/
//! window and the conditional-request state machine.

use crate::condition::is_not_modified;
use crate::context::RequestContext;
use crate::error::Error;
use crate::filter::{apply_filters, apply_sorts, apply_window, ListOpts};
use crate::metadata::{hash_list, Record};
use crate::registry::TypeConfig;
use reflecta_store::RecordStore;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of a conditional single-object read.
pub enum GetOutcome<T> {
    Found(T),
    NotModified,
    NotFound,
}

#[derive(Clone)]
pub struct Reader<T: Record> {
    store: Arc<dyn RecordStore>,
    config: Arc<TypeConfig<T>>,
}

impl<T: Record> Reader<T> {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<TypeConfig<T>>) -> Self {
        Reader { store, config }
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        id: &str,
        if_none_match: Option<&str>,
    ) -> Result<GetOutcome<T>, Error> {
        let Some(value) = self.store.read(&self.config.api_name, id).await.map_err(Error::from)? else {
            return Ok(GetOutcome::NotFound);
        };

        if !self.config.check_read(ctx, &value)? {
            return Err(Error::forbidden(format!("{id} is not visible to caller")));
        }

        let (etag, generation) = etag_and_generation(&value);
        if is_not_modified(if_none_match, &etag, generation) {
            return Ok(GetOutcome::NotModified);
        }

        Ok(GetOutcome::Found(crate::json::from_value(value)?))
    }

    /// Runs the full list pipeline: list hook -> read check -> filters ->
    /// sorts -> window, then computes the list-ETag. Returns `None` for the
    /// body when the freshly computed list-ETag matches `If-None-Match`.
    pub async fn list(&self, ctx: &RequestContext, mut opts: ListOpts) -> Result<ListResult, Error> {
        self.config.run_list_hook(ctx, &mut opts);

        let all = self.store.list(&self.config.api_name).await.map_err(Error::from)?;
        let list = self.filter_sort_window(ctx, &all, &opts)?;
        let etag = hash_list(&list);

        if is_not_modified(opts.if_none_match.as_deref(), &etag, 0) {
            return Ok(ListResult { items: None, etag });
        }

        Ok(ListResult { items: Some(list), etag })
    }

    /// The list-hook/read-check/filter/sort/window pipeline without the
    /// conditional-request short-circuit, shared with the Subscription
    /// Fan-out which re-runs it on every store snapshot.
    pub fn filter_sort_window(
        &self,
        ctx: &RequestContext,
        all: &[Value],
        opts: &ListOpts,
    ) -> Result<Vec<Value>, Error> {
        filter_sort_window(&self.config, ctx, all, opts)
    }
}

/// Free-function form of the list-hook/read-check/filter/sort/window
/// pipeline: takes `&TypeConfig<T>` directly rather than `&Reader<T>` so the
/// Subscription Fan-out can run it from inside a spawned task that only owns
/// an `Arc<TypeConfig<T>>`, with no `Reader` (and its store handle) to keep
/// alive.
pub fn filter_sort_window<T: Record>(
    config: &TypeConfig<T>,
    ctx: &RequestContext,
    all: &[Value],
    opts: &ListOpts,
) -> Result<Vec<Value>, Error> {
    let mut visible = Vec::with_capacity(all.len());
    for item in all {
        if config.check_read(ctx, item)? {
            visible.push(item.clone());
        }
    }

    let filtered = apply_filters(visible, &opts.filters)?;
    let sorted = apply_sorts(filtered, &opts.sorts);
    Ok(apply_window(sorted, opts.offset, opts.after.as_deref(), opts.limit))
}

pub struct ListResult {
    pub items: Option<Vec<Value>>,
    pub etag: String,
}

fn etag_and_generation(value: &Value) -> (String, u64) {
    let etag = value.get("etag").and_then(Value::as_str).unwrap_or_default().to_string();
    let generation = value.get("generation").and_then(Value::as_u64).unwrap_or(0);
    (etag, generation)
}
