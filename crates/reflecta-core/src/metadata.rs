//! Metadata block every record embeds, and the content-hashing rules that
//! derive `ETag`/list-ETag from it.

use facet::Facet;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Server-owned bookkeeping embedded in every record. Fields here are never
/// set directly by clients: the write pipeline overwrites them according to
/// the rules in `reflecta-core::pipeline`.
#[derive(Facet, Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub id: String,
    pub generation: u64,
    pub etag: String,
}

/// A record type that can be stored by this runtime. `T` must carry the three
/// `Metadata` fields at the top level (so they serialize flat, alongside the
/// type's own fields) and be cheap to clone; the core never holds a record
/// across an await point without cloning it first.
///
/// `metadata`/`set_metadata` return and accept `Metadata` by value rather than
/// by reference: implementers declare `id`/`generation`/`etag` as ordinary
/// top-level fields (the facet equivalent of Go's anonymous-struct-embedding
/// JSON flattening) and these two methods just project them in and out.
pub trait Record: Facet<'static> + Clone + Send + Sync + std::fmt::Debug + 'static {
    fn metadata(&self) -> Metadata;
    fn set_metadata(&mut self, metadata: Metadata);
}

/// Generates a fresh, URL-safe, random record ID. Not derived from content or
/// a counter: two records created back to back must not collide and must not
/// be guessable from each other.
pub fn new_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Computes the content ETag of a JSON record, holding the `etag` field fixed
/// (empty) while hashing so the tag never depends on its own prior value.
pub fn content_etag(value: &Value) -> String {
    let mut scrubbed = value.clone();
    if let Some(obj) = scrubbed.as_object_mut() {
        obj.insert("etag".to_string(), Value::String(String::new()));
    }
    let canonical = canonical_json(&scrubbed);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// List-ETag: sha256 over the concatenation of `ETag + "\n"` for every item,
/// in the order given, hex-encoded with an `etag:` prefix.
pub fn hash_list(items: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        let etag = item
            .get("etag")
            .and_then(Value::as_str)
            .unwrap_or_default();
        hasher.update(etag.as_bytes());
        hasher.update(b"\n");
    }
    format!("etag:{:x}", hasher.finalize())
}

/// Serializes with sorted object keys so semantically identical JSON always
/// hashes the same way regardless of field insertion order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_id_is_nonempty_and_varies() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn etag_is_stable_under_key_reordering() {
        let a = json!({"id": "x", "etag": "", "text": "foo", "generation": 1});
        let b = json!({"generation": 1, "text": "foo", "id": "x", "etag": "whatever"});
        assert_eq!(content_etag(&a), content_etag(&b));
    }

    #[test]
    fn etag_changes_with_content() {
        let a = json!({"text": "foo"});
        let b = json!({"text": "bar"});
        assert_ne!(content_etag(&a), content_etag(&b));
    }

    #[test]
    fn hash_list_is_order_sensitive() {
        let a = vec![json!({"etag": "e1"}), json!({"etag": "e2"})];
        let b = vec![json!({"etag": "e2"}), json!({"etag": "e1"})];
        assert_ne!(hash_list(&a), hash_list(&b));
        assert_eq!(hash_list(&a), hash_list(&a.clone()));
    }
}
