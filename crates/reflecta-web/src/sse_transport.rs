//! Drives a `Fanout` subscription through an SSE encoder and into a streaming
//! response body, ticking a heartbeat on a fixed interval regardless of
//! subscription activity (§5).

use crate::handlers::TypeState;
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use reflecta_core::context::RequestContext;
use reflecta_core::error::Error;
use reflecta_core::filter::{ListOpts, StreamFormat};
use reflecta_core::metadata::Record;
use reflecta_core::sse::{
    error_event, heartbeat_event, ListStreamDiffEncoder, ListStreamFullEncoder, ObjectStreamEncoder,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CHANNEL_BUFFER: usize = 16;

pub fn sse_response(rx: mpsc::Receiver<String>) -> Response {
    let stream = ReceiverStream::new(rx).map(|frame| Ok::<Bytes, std::io::Error>(Bytes::from(frame)));
    let body = Body::from_stream(stream);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub async fn object_stream<T: Record>(
    state: &TypeState<T>,
    ctx: RequestContext,
    id: &str,
    if_none_match: Option<String>,
) -> Result<Response, Error> {
    let mut sub = state.fanout.subscribe_object(ctx, id).await?;
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
    let heartbeat = state.heartbeat;

    tokio::spawn(async move {
        let mut encoder = ObjectStreamEncoder::new(if_none_match);
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            tokio::select! {
                item = sub.recv() => {
                    let frame = match item {
                        None => encoder.encode(None),
                        Some(Ok(value)) => encoder.encode(Some(&value)),
                        Some(Err(e)) => {
                            let _ = tx.send(error_event(&e)).await;
                            break;
                        }
                    };
                    let closed = item_was_close(&frame);
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                    if closed {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(heartbeat_event()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(sse_response(rx))
}

pub async fn list_stream<T: Record>(
    state: &TypeState<T>,
    ctx: RequestContext,
    opts: ListOpts,
    if_none_match: Option<String>,
) -> Result<Response, Error> {
    let format = opts.stream.unwrap_or(StreamFormat::Full);
    let mut sub = state.fanout.subscribe_list(ctx, opts).await?;
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
    let heartbeat = state.heartbeat;

    tokio::spawn(async move {
        let mut full_encoder = ListStreamFullEncoder::new(if_none_match.clone());
        let mut diff_encoder = ListStreamDiffEncoder::new(if_none_match);
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            tokio::select! {
                item = sub.recv() => {
                    let Some(item) = item else { break };
                    let list = match item {
                        Ok(list) => list,
                        Err(e) => {
                            let _ = tx.send(error_event(&e)).await;
                            break;
                        }
                    };
                    let frames = match format {
                        StreamFormat::Full => full_encoder.encode(&list).into_iter().collect::<Vec<_>>(),
                        StreamFormat::Diff => diff_encoder.encode(&list),
                    };
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(heartbeat_event()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(sse_response(rx))
}

fn item_was_close(frame: &str) -> bool {
    frame.starts_with("event: delete\n")
}
