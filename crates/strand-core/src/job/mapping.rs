//! Queue step input mapping.

use serde_json::{Map, Value};
use strand_types::queue::InputMap;

/// Compute a step's input from the previous output and the queue's initial input.
///
/// Field maps apply in key order, so an empty target (`""`, whole-input
/// replacement) is applied before any dotted target is written on top of it.
/// Unresolvable sources map to `null`.
pub fn map_input(map: &InputMap, prev: &Value, initial: &Value) -> Value {
    match map {
        InputMap::Custom(f) => f(prev, initial),
        InputMap::Fields(fields) => {
            let mut input = Value::Object(Map::new());
            for (target, source) in fields {
                let value = resolve(source, prev, initial);
                if target.is_empty() {
                    input = value;
                } else {
                    set_path(&mut input, target, value);
                }
            }
            input
        }
    }
}

/// Resolve `prev`, `prev.<path>`, `initial` or `initial.<path>`.
fn resolve(source: &str, prev: &Value, initial: &Value) -> Value {
    let (root, path) = match source.split_once('.') {
        Some((root, path)) => (root, Some(path)),
        None => (source, None),
    };
    let base = match root {
        "prev" => prev,
        "initial" => initial,
        _ => return Value::Null,
    };
    match path {
        None => base.clone(),
        Some(path) => get_path(base, path).cloned().unwrap_or(Value::Null),
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
