//! Bridges the two JSON representations in play: `facet_json` for typed
//! records (the reflection-driven wire format) and `serde_json::Value` as the
//! generic intermediate used for filtering, sorting, hashing, and storage.
//! Every clone-before-check in the Authorization Gate goes through here.

use crate::error::Error;
use crate::metadata::Record;
use serde_json::Value;

pub fn to_value<T: Record>(record: &T) -> Result<Value, Error> {
    let json = facet_json::to_string(record)
        .map_err(|e| Error::internal(format!("facet_json serialize failed: {e}")))?;
    serde_json::from_str(&json)
        .map_err(|e| Error::internal(format!("serde_json decode failed: {e}")))
}

pub fn from_value<T: Record>(value: Value) -> Result<T, Error> {
    let json = serde_json::to_string(&value)
        .map_err(|e| Error::internal(format!("serde_json encode failed: {e}")))?;
    facet_json::from_str(&json)
        .map_err(|e| Error::bad_request(format!("facet_json deserialize failed: {e}")))
}

/// JSON round-trip clone: the same mechanism the Authorization Gate relies on
/// to guarantee capability-check side effects can't corrupt stored state.
pub fn clone_via_json<T: Record>(record: &T) -> Result<T, Error> {
    from_value(to_value(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use facet::Facet;

    #[derive(Facet, Clone, Debug)]
    struct Widget {
        id: String,
        generation: u64,
        etag: String,
        text: String,
    }

    impl Record for Widget {
        fn metadata(&self) -> Metadata {
            Metadata {
                id: self.id.clone(),
                generation: self.generation,
                etag: self.etag.clone(),
            }
        }
        fn set_metadata(&mut self, metadata: Metadata) {
            self.id = metadata.id;
            self.generation = metadata.generation;
            self.etag = metadata.etag;
        }
    }

    #[test]
    fn roundtrips_through_value() {
        let w = Widget {
            id: "w1".into(),
            generation: 1,
            etag: "e1".into(),
            text: "foo".into(),
        };
        let v = to_value(&w).unwrap();
        assert_eq!(v["text"], "foo");
        let back: Widget = from_value(v).unwrap();
        assert_eq!(back.text, "foo");
        assert_eq!(back.id, "w1");
    }
}
