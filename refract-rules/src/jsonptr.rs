//! RFC-6901 JSON Pointer resolution and RFC-6902 JSON Patch application.
//!
//! Pointers must be empty (document root) or start with `/`; tokens use
//! the `~0`/`~1` escapes. Array indices are strict: digits only, no
//! leading zeros, with `-` accepted as the append position for `add`.

use crate::spec::{PatchOp, PatchOpKind};
use serde_json::Value;

/// Split a pointer into unescaped reference tokens. Returns `None` for a
/// syntactically invalid pointer.
pub fn parse_pointer(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    if !pointer.starts_with('/') {
        return None;
    }
    Some(
        pointer[1..]
            .split('/')
            .map(|tok| tok.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}

/// Parse a strict array index: digits only, no leading zeros.
fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Resolve a pointer to a node.
pub fn get<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    let mut cur = doc;
    for tok in tokens {
        cur = match cur {
            Value::Object(map) => map.get(tok)?,
            Value::Array(arr) => arr.get(parse_index(tok)?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn get_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut cur = doc;
    for tok in tokens {
        cur = match cur {
            Value::Object(map) => map.get_mut(tok)?,
            Value::Array(arr) => {
                let idx = parse_index(tok)?;
                arr.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(cur)
}

/// `add`: insert into an object (replacing an existing member), insert
/// into an array shifting later elements (`-` appends), or replace the
/// whole document at the root.
pub fn add(doc: &mut Value, tokens: &[String], value: Value) -> bool {
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return true;
    };
    let Some(parent) = get_mut(doc, parents) else {
        return false;
    };
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            true
        }
        Value::Array(arr) => {
            if last == "-" {
                arr.push(value);
                return true;
            }
            match parse_index(last) {
                Some(idx) if idx <= arr.len() => {
                    arr.insert(idx, value);
                    true
                }
                _ => false,
            }
        }
        _ => false,
    }
}

/// `remove`: the target location must exist.
pub fn remove(doc: &mut Value, tokens: &[String]) -> Option<Value> {
    let (last, parents) = tokens.split_last()?;
    let parent = get_mut(doc, parents)?;
    match parent {
        Value::Object(map) => map.remove(last),
        Value::Array(arr) => {
            let idx = parse_index(last)?;
            if idx < arr.len() {
                Some(arr.remove(idx))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// `replace`: the target location must exist.
pub fn replace(doc: &mut Value, tokens: &[String], value: Value) -> bool {
    match get_mut(doc, tokens) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

/// Apply an ordered RFC-6902 operation list to a JSON text. An empty
/// source document starts as `{}`. Returns `None` when the document does
/// not parse or any operation (including `test`) fails.
pub fn apply_patch(doc_text: &str, ops: &[PatchOp]) -> Option<String> {
    let mut doc: Value = if doc_text.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(doc_text).ok()?
    };

    for op in ops {
        let tokens = parse_pointer(&op.path)?;
        let ok = match op.op {
            PatchOpKind::Add => add(&mut doc, &tokens, op.value.clone()),
            PatchOpKind::Remove => remove(&mut doc, &tokens).is_some(),
            PatchOpKind::Replace => replace(&mut doc, &tokens, op.value.clone()),
            PatchOpKind::Copy => {
                let from = parse_pointer(&op.from)?;
                match get(&doc, &from).cloned() {
                    Some(src) => add(&mut doc, &tokens, src),
                    None => false,
                }
            }
            PatchOpKind::Move => {
                let from = parse_pointer(&op.from)?;
                match remove(&mut doc, &from) {
                    Some(src) => add(&mut doc, &tokens, src),
                    None => false,
                }
            }
            PatchOpKind::Test => get(&doc, &tokens) == Some(&op.value),
        };
        if !ok {
            return None;
        }
    }

    serde_json::to_string(&doc).ok()
}

/// Resolve a pointer against a JSON body and render the node as a scalar
/// string: strings verbatim, integral numbers without a decimal point,
/// booleans as `true`/`false`, anything else as compact JSON.
pub fn resolve_scalar(body: &str, pointer: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(body).ok()?;
    if pointer.is_empty() || !pointer.starts_with('/') {
        return None;
    }
    let tokens = parse_pointer(pointer)?;
    let node = get(&doc, &tokens)?;
    Some(match node {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        other => serde_json::to_string(other).ok()?,
    })
}
