//! List query algebra: filter/sort/window, and list-stream format selection.

use crate::error::Error;
use crate::path;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Hp,
    In,
}

impl Op {
    fn parse(s: &str) -> Option<Op> {
        match s {
            "eq" => Some(Op::Eq),
            "gt" => Some(Op::Gt),
            "gte" => Some(Op::Gte),
            "lt" => Some(Op::Lt),
            "lte" => Some(Op::Lte),
            "hp" => Some(Op::Hp),
            "in" => Some(Op::In),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub path: String,
    pub op: Op,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub path: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Full,
    Diff,
}

#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub stream: Option<StreamFormat>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub after: Option<String>,
    pub sorts: Vec<Sort>,
    pub filters: Vec<Filter>,
    pub if_none_match: Option<String>,
}

/// Parses reserved (`_`-prefixed) and filter query keys from a raw list of
/// `(key, value)` pairs, framework-agnostic so both the HTTP layer and tests
/// can drive it directly.
pub fn parse_list_opts(pairs: &[(String, String)]) -> Result<ListOpts, Error> {
    let mut opts = ListOpts::default();
    let mut raw_sorts = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "_stream" => {
                opts.stream = Some(match value.as_str() {
                    "full" => StreamFormat::Full,
                    "diff" => StreamFormat::Diff,
                    other => {
                        return Err(Error::bad_request(format!("invalid _stream: {other}")));
                    }
                });
            }
            "_limit" => {
                let n: u64 = value
                    .parse()
                    .map_err(|_| Error::bad_request(format!("invalid _limit: {value}")))?;
                opts.limit = if n == 0 { None } else { Some(n) };
            }
            "_offset" => {
                opts.offset = value
                    .parse()
                    .map_err(|_| Error::bad_request(format!("invalid _offset: {value}")))?;
            }
            "_after" => {
                opts.after = Some(value.clone());
            }
            "_sort" => {
                if value.is_empty() {
                    return Err(Error::bad_request("invalid _sort: empty"));
                }
                raw_sorts.push(value.clone());
            }
            other if other.starts_with('_') => {
                // Unknown reserved keys are ignored rather than rejected, so
                // future reserved parameters don't need every caller upgraded.
            }
            path_key => {
                let (path, op) = parse_filter_key(path_key)?;
                opts.filters.push(Filter {
                    path,
                    op,
                    value: value.clone(),
                });
            }
        }
    }

    // Collected in submission order, then reversed: later ApplySorts calls
    // overwrite the relative order of earlier ones under a stable sort, so
    // applying the last-specified sort first makes the first `_sort` key the
    // dominant one, matching the pipeline's historical behavior.
    for raw in raw_sorts.into_iter().rev() {
        if let Some(p) = raw.strip_prefix('+') {
            opts.sorts.push(Sort { path: p.to_string(), descending: false });
        } else if let Some(p) = raw.strip_prefix('-') {
            opts.sorts.push(Sort { path: p.to_string(), descending: true });
        } else {
            opts.sorts.push(Sort { path: raw, descending: false });
        }
    }

    Ok(opts)
}

fn parse_filter_key(key: &str) -> Result<(String, Op), Error> {
    if let Some(open) = key.find('[') {
        if key.ends_with(']') {
            let path = key[..open].to_string();
            let op_str = &key[open + 1..key.len() - 1];
            let op = Op::parse(op_str)
                .ok_or_else(|| Error::bad_request(format!("invalid filter operator: {op_str}")))?;
            return Ok((path, op));
        }
    }
    Ok((key.to_string(), Op::Eq))
}

/// Drops items that don't match every filter (filters are ANDed).
pub fn apply_filters(items: Vec<Value>, filters: &[Filter]) -> Result<Vec<Value>, Error> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if matches_all(&item, filters)? {
            out.push(item);
        }
    }
    Ok(out)
}

fn matches_all(item: &Value, filters: &[Filter]) -> Result<bool, Error> {
    for filter in filters {
        if !matches_one(item, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_one(item: &Value, filter: &Filter) -> Result<bool, Error> {
    let field = path::get(item, &filter.path);

    match filter.op {
        Op::Eq => Ok(field.map(|v| value_eq_str(v, &filter.value)).unwrap_or(false)),
        Op::Hp => Ok(field
            .and_then(Value::as_str)
            .map(|s| s.starts_with(&filter.value))
            .unwrap_or(false)),
        Op::In => {
            let candidates: Vec<&str> = filter.value.split(',').collect();
            Ok(field
                .map(|v| candidates.iter().any(|c| value_eq_str(v, c)))
                .unwrap_or(false))
        }
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let Some(field) = field else { return Ok(false) };
            let ordering = compare(field, &filter.value)?;
            Ok(match filter.op {
                Op::Gt => ordering == std::cmp::Ordering::Greater,
                Op::Gte => ordering != std::cmp::Ordering::Less,
                Op::Lt => ordering == std::cmp::Ordering::Less,
                Op::Lte => ordering != std::cmp::Ordering::Greater,
                _ => unreachable!(),
            })
        }
    }
}

fn value_eq_str(value: &Value, raw: &str) -> bool {
    match value {
        Value::String(s) => s == raw,
        Value::Number(n) => raw.parse::<f64>().ok() == n.as_f64(),
        Value::Bool(b) => raw.parse::<bool>().map(|r| r == *b).unwrap_or(false),
        Value::Null => raw.is_empty(),
        other => other.to_string() == raw,
    }
}

fn compare(value: &Value, raw: &str) -> Result<std::cmp::Ordering, Error> {
    match value {
        Value::Number(n) => {
            let lhs = n.as_f64().ok_or_else(|| Error::bad_request("non-finite number in filter"))?;
            let rhs: f64 = raw
                .parse()
                .map_err(|_| Error::bad_request(format!("cannot compare non-numeric value: {raw}")))?;
            Ok(lhs.partial_cmp(&rhs).unwrap_or(std::cmp::Ordering::Equal))
        }
        Value::String(s) => Ok(s.as_str().cmp(raw)),
        other => Err(Error::bad_request(format!("cannot order-compare value: {other}"))),
    }
}

/// Applies every sort key in order, using a stable sort so earlier keys in
/// `sorts` remain dominant over later ones.
pub fn apply_sorts(mut items: Vec<Value>, sorts: &[Sort]) -> Vec<Value> {
    for sort in sorts {
        items.sort_by(|a, b| {
            let av = path::get(a, &sort.path);
            let bv = path::get(b, &sort.path);
            let ordering = compare_values(av, bv);
            if sort.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    items
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}

/// Offset, then `_after` (skip up to and including the matching ID), then
/// limit — applied in a single left-to-right pass, matching the reference
/// pipeline's combined loop.
pub fn apply_window(items: Vec<Value>, offset: u64, after: Option<&str>, limit: Option<u64>) -> Vec<Value> {
    let mut offset = offset;
    let mut after = after.map(|s| s.to_string());
    let mut limit = limit;
    let mut out = Vec::new();

    for item in items {
        if let Some(target) = &after {
            let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
            if id == target {
                after = None;
            }
            continue;
        }

        if offset > 0 {
            offset -= 1;
            continue;
        }

        if let Some(remaining) = limit {
            if remaining == 0 {
                break;
            }
            limit = Some(remaining - 1);
        }

        out.push(item);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> Vec<Value> {
        vec![
            json!({"id": "1", "text": "foo"}),
            json!({"id": "2", "text": "bar"}),
        ]
    }

    #[test]
    fn filters_eq_and_hp() {
        let eq = Filter { path: "text".into(), op: Op::Eq, value: "foo".into() };
        let out = apply_filters(widgets(), &[eq]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], "1");

        let hp = Filter { path: "text".into(), op: Op::Hp, value: "f".into() };
        let out = apply_filters(widgets(), &[hp]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], "1");
    }

    #[test]
    fn sort_ascending_and_descending() {
        let sorted = apply_sorts(widgets(), &[Sort { path: "text".into(), descending: false }]);
        assert_eq!(sorted[0]["text"], "bar");
        assert_eq!(sorted[1]["text"], "foo");

        let sorted = apply_sorts(widgets(), &[Sort { path: "text".into(), descending: true }]);
        assert_eq!(sorted[0]["text"], "foo");
    }

    #[test]
    fn window_limit_one_after_sort() {
        let sorted = apply_sorts(widgets(), &[Sort { path: "text".into(), descending: false }]);
        let windowed = apply_window(sorted, 0, None, Some(1));
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0]["text"], "bar");
    }

    #[test]
    fn after_skips_up_to_and_including() {
        let items = vec![json!({"id": "1"}), json!({"id": "2"}), json!({"id": "3"})];
        let out = apply_window(items, 0, Some("2"), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], "3");
    }

    #[test]
    fn limit_zero_parses_as_unbounded() {
        let opts = parse_list_opts(&[("_limit".into(), "0".into())]).unwrap();
        assert_eq!(opts.limit, None);
    }

    #[test]
    fn filter_key_with_operator_parses() {
        let opts = parse_list_opts(&[("text[hp]".into(), "f".into())]).unwrap();
        assert_eq!(opts.filters.len(), 1);
        assert_eq!(opts.filters[0].op, Op::Hp);
        assert_eq!(opts.filters[0].path, "text");
    }

    #[test]
    fn invalid_operator_is_bad_request() {
        let err = parse_list_opts(&[("text[bogus]".into(), "f".into())]).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
