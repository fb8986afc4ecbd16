//! SSE Encoder (4.H): frames the object-stream and list-stream state machines
//! into `text/event-stream` bytes. Pure encoding logic — the transport loop
//! that drives a `Fanout` subscription through these encoders and writes the
//! result to a response body lives in the web crate.

use crate::condition::is_not_modified;
use crate::error::Error;
use crate::metadata::hash_list;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Frames one SSE event: `event:` line, any extra params, an optional
/// `data:` line, then a blank line. Matches the wire shape in 4.H exactly.
pub fn write_event(event: &str, params: &[(&str, &str)], data: Option<&Value>) -> String {
    let mut buf = String::new();
    buf.push_str("event: ");
    buf.push_str(event);
    buf.push('\n');
    for (k, v) in params {
        buf.push_str(k);
        buf.push_str(": ");
        buf.push_str(v);
        buf.push('\n');
    }
    if let Some(data) = data {
        buf.push_str("data: ");
        buf.push_str(&serde_json::to_string(data).unwrap_or_default());
        buf.push('\n');
    }
    buf.push('\n');
    buf
}

pub fn heartbeat_event() -> String {
    write_event("heartbeat", &[], None)
}

/// Terminal frame for a stream that cannot continue (subscriber too slow,
/// source store failure, ...): same `{ messages, code }` wire shape as a
/// non-stream error response, carried as the `data:` payload of an `error`
/// event. The transport closes the connection immediately after writing this.
pub fn error_event(err: &Error) -> String {
    let body = json!({ "messages": err.messages(), "code": err.status() });
    write_event("error", &[], Some(&body))
}

/// Object-stream state machine (4.H): the first delivery becomes `initial`
/// (or `notModified` if it satisfies the subscribe-time `If-None-Match`),
/// every later delivery is `update`, and a closed source stream is `delete`.
pub struct ObjectStreamEncoder {
    first: bool,
    if_none_match: Option<String>,
}

impl ObjectStreamEncoder {
    pub fn new(if_none_match: Option<String>) -> Self {
        ObjectStreamEncoder { first: true, if_none_match }
    }

    /// `item` is `None` exactly when the underlying stream has closed
    /// (object deleted, or the subscription's read check stopped passing).
    pub fn encode(&mut self, item: Option<&Value>) -> String {
        let Some(value) = item else {
            return write_event("delete", &[], None);
        };

        let etag = value.get("etag").and_then(Value::as_str).unwrap_or_default().to_string();
        let generation = value.get("generation").and_then(Value::as_u64).unwrap_or(0);

        let mut event_type = "update";
        if self.first {
            self.first = false;
            event_type = "initial";
            // Consumed exactly once, on the first delivery, regardless of
            // whether it matched — later deliveries are never notModified.
            if let Some(header) = self.if_none_match.take() {
                if is_not_modified(Some(&header), &etag, generation) {
                    return write_event("notModified", &[("id", &etag)], None);
                }
            }
        }

        write_event(event_type, &[("id", &etag)], Some(value))
    }
}

/// `full` list-stream encoder: emits the whole filtered/sorted/windowed list
/// whenever its ETag changes, `notModified` once if the subscribe-time
/// `If-None-Match` is satisfied by the first snapshot, and nothing at all
/// when a later snapshot's ETag repeats the last one sent.
pub struct ListStreamFullEncoder {
    if_none_match: Option<String>,
    previous_etag: Option<String>,
}

impl ListStreamFullEncoder {
    pub fn new(if_none_match: Option<String>) -> Self {
        ListStreamFullEncoder { if_none_match, previous_etag: None }
    }

    pub fn encode(&mut self, list: &[Value]) -> Option<String> {
        let etag = hash_list(list);

        if let Some(header) = self.if_none_match.take() {
            if is_not_modified(Some(&header), &etag, 0) {
                return Some(write_event("notModified", &[("id", &etag)], None));
            }
        }

        if self.previous_etag.as_deref() == Some(etag.as_str()) {
            return None;
        }
        self.previous_etag = Some(etag.clone());

        Some(write_event("list", &[("id", &etag)], Some(&Value::Array(list.to_vec()))))
    }
}

struct ListEntry {
    pos: usize,
    value: Value,
}

/// `diff` list-stream encoder: removes before adds/updates (so positional
/// references in a client's local copy stay valid while it applies them),
/// followed by a trailing `sync` frame carrying the new list-ETag.
pub struct ListStreamDiffEncoder {
    if_none_match: Option<String>,
    previous_etag: Option<String>,
    last: HashMap<String, ListEntry>,
}

impl ListStreamDiffEncoder {
    pub fn new(if_none_match: Option<String>) -> Self {
        ListStreamDiffEncoder {
            if_none_match,
            previous_etag: None,
            last: HashMap::new(),
        }
    }

    /// Returns the ordered frames for this snapshot; empty when the list-ETag
    /// repeats the last one seen (can't happen on the very first snapshot).
    pub fn encode(&mut self, list: &[Value]) -> Vec<String> {
        let etag = hash_list(list);
        if self.previous_etag.as_deref() == Some(etag.as_str()) {
            return Vec::new();
        }
        self.previous_etag = Some(etag.clone());

        let mut cur: HashMap<String, ListEntry> = HashMap::with_capacity(list.len());
        for (pos, item) in list.iter().enumerate() {
            let id = item.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            cur.insert(id, ListEntry { pos, value: item.clone() });
        }

        if let Some(header) = self.if_none_match.take() {
            if is_not_modified(Some(&header), &etag, 0) {
                self.last = cur;
                return vec![write_event("notModified", &[("id", &etag)], None)];
            }
        }

        let mut frames = Vec::new();

        for (id, entry) in &self.last {
            if !cur.contains_key(id) {
                frames.push(write_event("remove", &[("old-position", &entry.pos.to_string())], None));
            }
        }

        for (pos, item) in list.iter().enumerate() {
            let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
            match self.last.get(id) {
                None => {
                    frames.push(write_event("add", &[("new-position", &pos.to_string())], Some(item)));
                }
                Some(prev_entry) => {
                    let prev_etag = prev_entry.value.get("etag").and_then(Value::as_str).unwrap_or_default();
                    let cur_etag = item.get("etag").and_then(Value::as_str).unwrap_or_default();
                    if prev_etag != cur_etag {
                        let old_pos = prev_entry.pos.to_string();
                        let new_pos = pos.to_string();
                        frames.push(write_event(
                            "update",
                            &[("old-position", &old_pos), ("new-position", &new_pos)],
                            Some(item),
                        ));
                    }
                }
            }
        }

        self.last = cur;
        frames.push(write_event("sync", &[("id", &etag)], None));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_event_frames_params_and_data() {
        let frame = write_event("update", &[("id", "abc")], Some(&json!({"text": "foo"})));
        assert_eq!(frame, "event: update\nid: abc\ndata: {\"text\":\"foo\"}\n\n");
    }

    #[test]
    fn error_event_carries_messages_and_code() {
        let frame = error_event(&crate::error::Error::internal("subscriber too slow, disconnecting"));
        assert!(frame.starts_with("event: error\n"));
        assert!(frame.contains("\"code\":500"));
        assert!(frame.contains("subscriber too slow, disconnecting"));
    }

    #[test]
    fn object_stream_first_delivery_is_initial_then_update_then_delete() {
        let mut enc = ObjectStreamEncoder::new(None);
        let v1 = json!({"id": "1", "etag": "e1", "generation": 1});
        assert!(enc.encode(Some(&v1)).starts_with("event: initial\n"));

        let v2 = json!({"id": "1", "etag": "e2", "generation": 2});
        assert!(enc.encode(Some(&v2)).starts_with("event: update\n"));

        assert_eq!(enc.encode(None), "event: delete\n\n");
    }

    #[test]
    fn object_stream_initial_not_modified_short_circuits_once() {
        let mut enc = ObjectStreamEncoder::new(Some("\"e1\"".to_string()));
        let v1 = json!({"id": "1", "etag": "e1", "generation": 1});
        assert!(enc.encode(Some(&v1)).starts_with("event: notModified\n"));

        // Second delivery is a plain update even if the etag happens to repeat.
        assert!(enc.encode(Some(&v1)).starts_with("event: update\n"));
    }

    #[test]
    fn list_full_suppresses_repeat_etag_and_emits_on_change() {
        let mut enc = ListStreamFullEncoder::new(None);
        let a = vec![json!({"id": "1", "etag": "e1"})];
        let first = enc.encode(&a).unwrap();
        assert!(first.starts_with("event: list\n"));

        assert!(enc.encode(&a).is_none());

        let b = vec![json!({"id": "1", "etag": "e2"})];
        let second = enc.encode(&b).unwrap();
        assert!(second.starts_with("event: list\n"));
    }

    #[test]
    fn list_full_not_modified_on_first_snapshot() {
        let a = vec![json!({"id": "1", "etag": "e1"})];
        let etag = hash_list(&a);
        let mut enc = ListStreamFullEncoder::new(Some(format!("\"{etag}\"")));
        let frame = enc.encode(&a).unwrap();
        assert!(frame.starts_with("event: notModified\n"));
    }

    #[test]
    fn list_diff_emits_add_then_sync_on_first_snapshot() {
        let mut enc = ListStreamDiffEncoder::new(None);
        let a = vec![json!({"id": "1", "etag": "e1"})];
        let frames = enc.encode(&a);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: add\n"));
        assert!(frames[1].starts_with("event: sync\n"));
    }

    #[test]
    fn list_diff_emits_remove_before_add_and_update() {
        let mut enc = ListStreamDiffEncoder::new(None);
        let a = vec![json!({"id": "1", "etag": "e1"}), json!({"id": "2", "etag": "e2"})];
        enc.encode(&a);

        // "1" removed, "2" updated, "3" added.
        let b = vec![json!({"id": "2", "etag": "e2b"}), json!({"id": "3", "etag": "e3"})];
        let frames = enc.encode(&b);
        assert!(frames[0].starts_with("event: remove\n"));
        assert!(frames.iter().any(|f| f.starts_with("event: update\n")));
        assert!(frames.iter().any(|f| f.starts_with("event: add\n")));
        assert!(frames.last().unwrap().starts_with("event: sync\n"));
    }

    #[test]
    fn list_diff_skips_unchanged_items() {
        let mut enc = ListStreamDiffEncoder::new(None);
        let a = vec![json!({"id": "1", "etag": "e1"})];
        enc.encode(&a);

        let b = vec![json!({"id": "1", "etag": "e1"}), json!({"id": "2", "etag": "e2"})];
        let frames = enc.encode(&b);
        // Only the add for "2" plus the trailing sync; "1" is untouched.
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: add\n"));
    }

    #[test]
    fn list_diff_no_frames_when_etag_repeats() {
        let mut enc = ListStreamDiffEncoder::new(None);
        let a = vec![json!({"id": "1", "etag": "e1"})];
        enc.encode(&a);
        assert!(enc.encode(&a).is_empty());
    }
}
