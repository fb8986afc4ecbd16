//! Subscription Fan-out (4.G): turns a store-level read-stream/list-stream
//! into a per-subscriber channel that has already passed the read check (and,
//! for lists, the full filter/sort/window pipeline). A subscriber that can't
//! keep up with deliveries is closed with a final error item rather than ever
//! blocking the store side.

use crate::context::RequestContext;
use crate::error::Error;
use crate::filter::ListOpts;
use crate::metadata::Record;
use crate::read::filter_sort_window;
use crate::registry::TypeConfig;
use reflecta_store::RecordStore;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bounded so a stalled subscriber can be detected and dropped instead of
/// making the publisher wait on it.
const SUBSCRIBER_BUFFER: usize = 32;

/// One delivered item to a subscriber, or the terminal slow-subscriber error
/// that precedes the channel closing.
pub type SubscriptionItem<V> = Result<V, Error>;

pub struct ObjectSubscription {
    rx: mpsc::Receiver<SubscriptionItem<Value>>,
    _guard: tokio::task::JoinHandle<()>,
}

impl ObjectSubscription {
    pub async fn recv(&mut self) -> Option<SubscriptionItem<Value>> {
        self.rx.recv().await
    }
}

pub struct ListSubscription {
    rx: mpsc::Receiver<SubscriptionItem<Vec<Value>>>,
    _guard: tokio::task::JoinHandle<()>,
}

impl ListSubscription {
    pub async fn recv(&mut self) -> Option<SubscriptionItem<Vec<Value>>> {
        self.rx.recv().await
    }
}

/// Owns the store handle and type configuration needed to fan out live
/// updates to many subscribers of one record type.
#[derive(Clone)]
pub struct Fanout<T: Record> {
    store: Arc<dyn RecordStore>,
    config: Arc<TypeConfig<T>>,
}

impl<T: Record> Fanout<T> {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<TypeConfig<T>>) -> Self {
        Fanout { store, config }
    }

    /// Subscribes to a single object. The first item (if any) is its current
    /// state; the stream ends, with no error item, when the object is deleted
    /// or the read check stops passing for it.
    pub async fn subscribe_object(&self, ctx: RequestContext, id: &str) -> Result<ObjectSubscription, Error> {
        let mut inner = self.store.read_stream(&self.config.api_name, id).await.map_err(Error::from)?;
        let config = self.config.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let guard = tokio::spawn(async move {
            while let Some(value) = inner.recv().await {
                let visible = match config.check_read(&ctx, &value) {
                    Ok(visible) => visible,
                    Err(_) => break,
                };
                if !visible {
                    break;
                }
                if !forward(&tx, Ok(value)) {
                    break;
                }
            }
            inner.close();
        });

        Ok(ObjectSubscription { rx, _guard: guard })
    }

    /// Subscribes to the type's list stream. Every snapshot delivered by the
    /// store is re-run through the shared filter/sort/window pipeline with
    /// `opts` before being handed to the subscriber, so each item the caller
    /// sees already reflects their query and their read check.
    pub async fn subscribe_list(&self, ctx: RequestContext, opts: ListOpts) -> Result<ListSubscription, Error> {
        let mut inner = self.store.list_stream(&self.config.api_name).await.map_err(Error::from)?;
        let config = self.config.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let guard = tokio::spawn(async move {
            while let Some(snapshot) = inner.recv().await {
                let mut opts = opts.clone();
                config.run_list_hook(&ctx, &mut opts);
                let windowed = match filter_sort_window(&config, &ctx, &snapshot, &opts) {
                    Ok(windowed) => windowed,
                    Err(e) => {
                        let _ = tx.try_send(Err(e));
                        break;
                    }
                };
                if !forward(&tx, Ok(windowed)) {
                    break;
                }
            }
            inner.close();
        });

        Ok(ListSubscription { rx, _guard: guard })
    }
}

/// Forwards one item with a non-blocking send. A full channel means the
/// subscriber is slow: it gets one final error item, then the stream ends.
/// Returns `false` when the caller should stop pulling from the store.
fn forward<V>(tx: &mpsc::Sender<SubscriptionItem<V>>, item: SubscriptionItem<V>) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            let _ = tx.try_send(Err(Error::internal("subscriber too slow, disconnecting")));
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse_list_opts;
    use crate::metadata::Metadata;
    use crate::pipeline::Pipeline;
    use facet::Facet;
    use reflecta_store::MemoryStore;

    #[derive(Facet, Clone, Debug)]
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

    fn widget(text: &str) -> Widget {
        Widget { id: String::new(), generation: 0, etag: String::new(), text: text.into() }
    }

    #[tokio::test]
    async fn object_subscription_delivers_current_then_update_then_closes_on_delete() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(TypeConfig::new("widget"));
        let pipeline = Pipeline::new(store.clone(), config.clone());
        let created = pipeline.create(&RequestContext::anonymous(), widget("foo")).await.unwrap();

        let fanout = Fanout::new(store.clone(), config.clone());
        let mut sub = fanout.subscribe_object(RequestContext::anonymous(), &created.id).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first["text"], "foo");

        pipeline
            .update(&RequestContext::anonymous(), &created.id, serde_json::json!({"text": "bar"}), None)
            .await
            .unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second["text"], "bar");

        pipeline.delete(&RequestContext::anonymous(), &created.id, None).await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn object_subscription_ends_when_read_check_fails() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(
            TypeConfig::<Widget>::new("widget").may_read(|w, _ctx| {
                if w.text == "secret" {
                    Err(Error::forbidden("nope"))
                } else {
                    Ok(())
                }
            }),
        );
        let pipeline = Pipeline::new(store.clone(), config.clone());
        let created = pipeline.create(&RequestContext::anonymous(), widget("foo")).await.unwrap();

        let fanout = Fanout::new(store.clone(), config.clone());
        let mut sub = fanout.subscribe_object(RequestContext::anonymous(), &created.id).await.unwrap();
        assert!(sub.recv().await.unwrap().unwrap()["text"] == "foo");

        pipeline
            .update(&RequestContext::anonymous(), &created.id, serde_json::json!({"text": "secret"}), None)
            .await
            .unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn list_subscription_reapplies_filter_sort_window_per_snapshot() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(TypeConfig::new("widget"));
        let pipeline = Pipeline::new(store.clone(), config.clone());
        pipeline.create(&RequestContext::anonymous(), widget("foo")).await.unwrap();

        let fanout = Fanout::new(store.clone(), config.clone());
        let opts = parse_list_opts(&[("_sort".into(), "text".into())]).unwrap();
        let mut sub = fanout.subscribe_list(RequestContext::anonymous(), opts).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        pipeline.create(&RequestContext::anonymous(), widget("bar")).await.unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0]["text"], "bar");
        assert_eq!(second[1]["text"], "foo");
    }
}
