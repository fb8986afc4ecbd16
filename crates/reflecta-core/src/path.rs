//! Minimal dotted-path expression evaluator over a generic JSON value. This is
//! an external collaborator in the source system; here it's a thin helper
//! rather than a general-purpose expression language.

use serde_json::Value;

/// Reads a `.`-separated path, returning `None` if any segment is missing or
/// the value at that point isn't an object.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |cur, key| cur.as_object()?.get(key))
}

/// Writes a `.`-separated path, creating intermediate objects as needed.
pub fn set(value: &mut Value, path: &str, new_value: Value) {
    let mut parts = path.split('.').peekable();
    let mut cur = value;
    while let Some(part) = parts.next() {
        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
        let map = cur.as_object_mut().expect("just ensured object");
        if parts.peek().is_none() {
            map.insert(part.to_string(), new_value);
            return;
        }
        cur = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_navigates_nested_objects() {
        let v = json!({"a": {"b": {"c": 1}}});
        assert_eq!(get(&v, "a.b.c"), Some(&json!(1)));
        assert_eq!(get(&v, "a.b.missing"), None);
        assert_eq!(get(&v, "a.x.c"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut v = json!({});
        set(&mut v, "a.b.c", json!(42));
        assert_eq!(v, json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn set_overwrites_leaf() {
        let mut v = json!({"text": "old"});
        set(&mut v, "text", json!("new"));
        assert_eq!(v, json!({"text": "new"}));
    }
}
