//! Bracket-notation codec shared by capture and relay.
//!
//! Capture parses flat `key=value` pairs such as `addr[city]=X` or `items[]=a` into nested
//! values, relay flattens them back into `addr[city]` and `items[0]` keys. Both directions live
//! here so that the round trip stays consistent.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::common::data::{append_value, MultiValue};

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Append,
}

/// Parses an `application/x-www-form-urlencoded` body into a nested form map.
pub fn parse_urlencoded(body: &[u8]) -> Map<String, Value> {
    parse_bracketed(form_urlencoded::parse(body).into_owned())
}

/// Parses a query string into a flat multi-map. Bracket keys are kept literally and
/// repeated keys become lists.
pub fn parse_query(query: &str) -> IndexMap<String, MultiValue> {
    let mut result = IndexMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()).into_owned() {
        append_value(&mut result, key, value);
    }
    result
}

/// Builds a nested map from bracket-notation keys. Maps whose keys are exactly `0..n` in
/// insertion order become lists.
pub fn parse_bracketed<I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root = Map::new();

    for (key, value) in pairs {
        let (base, segments) = split_key(&key);
        insert(&mut root, base, &segments, value);
    }

    root.into_iter().map(|(k, v)| (k, into_lists(v))).collect()
}

/// Flattens a nested form map into bracket-notation pairs, e.g. `{addr: {city: X}}` becomes
/// `addr[city]=X` and `{items: [a, b]}` becomes `items[0]=a`, `items[1]=b`.
pub fn flatten(form: &Map<String, Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in form {
        flatten_into(key.clone(), value, &mut out);
    }
    out
}

/// Serializes pairs as an `application/x-www-form-urlencoded` string.
pub fn encode_urlencoded(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn flatten_into(prefix: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(format!("{}[{}]", prefix, k), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(format!("{}[{}]", prefix, i), v, out);
            }
        }
        Value::String(s) => out.push((prefix, s.clone())),
        Value::Number(n) => out.push((prefix, n.to_string())),
        Value::Bool(b) => out.push((prefix, if *b { "1" } else { "0" }.to_string())),
        Value::Null => out.push((prefix, String::new())),
    }
}

fn split_key(key: &str) -> (String, Vec<Segment>) {
    let open = match key.find('[') {
        Some(idx) if idx > 0 => idx,
        _ => return (key.to_string(), Vec::new()),
    };

    let mut segments = Vec::new();
    let mut rest = &key[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            break;
        };
        let inner = &stripped[..close];
        segments.push(if inner.is_empty() {
            Segment::Append
        } else {
            Segment::Key(inner.to_string())
        });
        rest = &stripped[close + 1..];
    }

    if segments.is_empty() {
        return (key.to_string(), segments);
    }

    (key[..open].to_string(), segments)
}

fn insert(target: &mut Map<String, Value>, key: String, rest: &[Segment], value: String) {
    let Some((segment, rest)) = rest.split_first() else {
        target.insert(key, Value::String(value));
        return;
    };

    let child = target
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }

    if let Value::Object(child) = child {
        let key = match segment {
            Segment::Key(k) => k.clone(),
            Segment::Append => next_index(child).to_string(),
        };
        insert(child, key, rest, value);
    }
}

fn next_index(map: &Map<String, Value>) -> usize {
    map.keys()
        .filter_map(|k| k.parse::<usize>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

fn into_lists(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let is_list =
                !map.is_empty() && map.keys().enumerate().all(|(i, k)| *k == i.to_string());

            if is_list {
                Value::Array(map.into_iter().map(|(_, v)| into_lists(v)).collect())
            } else {
                Value::Object(map.into_iter().map(|(k, v)| (k, into_lists(v))).collect())
            }
        }
        other => other,
    }
}
