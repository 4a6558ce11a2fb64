//! JSON codec
//!
//! Each key is a member holding its value, preceded by a `"<name>/key"`
//! member with its metadata:
//!
//! ```json
//! {
//!   "Event ID/key": { "type": 4 },
//!   "Event ID": 7,
//!   "Name/key": { "type": 12, "item_size": 32 },
//!   "Name": "Sample",
//!   "Data/key": { "type": 7, "num_values": 2 },
//!   "Data": [1, 2],
//!   "Alias/key": { "type": 16, "link": "/Equipment/Test" },
//!   "Settings": { "Gain/key": { "type": 10 }, "Gain": 1.5 }
//! }
//! ```
//!
//! Directories carry no metadata member. On load a member without metadata
//! gets its type from the JSON value (string, boolean, integer or float).

use odb_core::{Database, TypeId, Value};
use serde_json::{json, Map, Number, Value as Json};

use crate::error::{CodecError, CodecResult};
use crate::tree::{read_subtree, write_subtree, Node};

/// Export the subtree at `handle`, pretty printed.
pub fn save_json(db: &Database, handle: u32) -> CodecResult<String> {
    Ok(serde_json::to_string_pretty(&to_json(&read_subtree(db, handle)?))?)
}

/// Import `text` below the directory `target`.
pub fn load_json(db: &Database, target: u32, text: &str) -> CodecResult<()> {
    let json: Json = serde_json::from_str(text)?;
    write_subtree(db, target, &from_json(&json)?)
}

pub fn to_json(node: &Node) -> Json {
    let mut object = Map::new();
    match node {
        Node::Dir { children, .. } => {
            for child in children {
                insert_node(&mut object, child);
            }
        }
        other => insert_node(&mut object, other),
    }
    Json::Object(object)
}

fn insert_node(object: &mut Map<String, Json>, node: &Node) {
    match node {
        Node::Dir { name, .. } => {
            object.insert(name.clone(), to_json(node));
        }
        Node::Link { name, target } => {
            object.insert(
                format!("{}/key", name),
                json!({ "type": TypeId::Link.as_u32(), "link": target }),
            );
        }
        Node::Leaf {
            name,
            tid,
            item_size,
            values,
        } => {
            let mut meta = Map::new();
            meta.insert("type".into(), json!(tid.as_u32()));
            if values.len() != 1 {
                meta.insert("num_values".into(), json!(values.len()));
            }
            if tid.is_text() {
                meta.insert("item_size".into(), json!(item_size));
            }
            object.insert(format!("{}/key", name), Json::Object(meta));
            let value = if values.len() == 1 {
                value_to_json(&values[0])
            } else {
                Json::Array(values.iter().map(value_to_json).collect())
            };
            object.insert(name.clone(), value);
        }
    }
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Uint8(v) => json!(v),
        Value::Int8(v) => json!(v),
        Value::Char(_) | Value::Str(_) => Json::String(value.to_string()),
        Value::Uint16(v) => json!(v),
        Value::Int16(v) => json!(v),
        Value::Uint32(v) | Value::Bitfield(v) => json!(v),
        Value::Int32(v) => json!(v),
        Value::Bool(v) => json!(v),
        Value::Int64(v) => json!(v),
        Value::Uint64(v) => json!(v),
        // Non-finite floats have no JSON number form
        Value::Float(v) => Number::from_f64(f64::from(*v)).map_or_else(|| Json::String(v.to_string()), Json::Number),
        Value::Double(v) => Number::from_f64(*v).map_or_else(|| Json::String(v.to_string()), Json::Number),
    }
}

fn json_to_value(tid: TypeId, json: &Json) -> CodecResult<Value> {
    let text = match json {
        Json::String(s) => s.clone(),
        Json::Bool(b) => (if *b { "y" } else { "n" }).to_string(),
        Json::Number(n) => n.to_string(),
        Json::Null => String::new(),
        other => return Err(CodecError::JsonShape(format!("{} cannot hold a {} value", other, tid.name()))),
    };
    Ok(Value::parse(tid, &text)?)
}

/// Type of a member that has no metadata.
fn infer_type(json: &Json) -> Option<TypeId> {
    match json {
        Json::String(_) => Some(TypeId::String),
        Json::Bool(_) => Some(TypeId::Bool),
        Json::Number(n) if n.is_i64() => {
            let v = n.as_i64()?;
            Some(if i32::try_from(v).is_ok() { TypeId::Int32 } else { TypeId::Int64 })
        }
        Json::Number(n) if n.is_u64() => Some(TypeId::Uint64),
        Json::Number(_) => Some(TypeId::Double),
        Json::Array(items) => items.first().and_then(infer_type),
        _ => None,
    }
}

pub fn from_json(json: &Json) -> CodecResult<Node> {
    let object = json
        .as_object()
        .ok_or_else(|| CodecError::JsonShape("top-level value is not an object".into()))?;
    Ok(Node::Dir {
        name: String::new(),
        children: read_object(object)?,
    })
}

fn read_object(object: &Map<String, Json>) -> CodecResult<Vec<Node>> {
    let mut children = Vec::new();
    for (name, value) in object {
        if let Some(base) = name.strip_suffix("/key") {
            // link metadata stands alone; other metadata is read with its value
            let is_link = value.get("type").and_then(Json::as_u64) == Some(TypeId::Link.as_u32() as u64);
            if is_link && !object.contains_key(base) {
                let target = value.get("link").and_then(Json::as_str).unwrap_or_default();
                children.push(Node::Link {
                    name: base.to_string(),
                    target: target.to_string(),
                });
            }
            continue;
        }
        children.push(read_member(name, value, object.get(&format!("{}/key", name)))?);
    }
    Ok(children)
}

fn read_member(name: &str, value: &Json, meta: Option<&Json>) -> CodecResult<Node> {
    let tid = match meta.and_then(|m| m.get("type")) {
        Some(t) => {
            let raw = t.as_u64().unwrap_or(0) as u32;
            TypeId::from_u32(raw).ok_or_else(|| CodecError::UnknownType(t.to_string()))?
        }
        None if value.is_object() => TypeId::Key,
        None => infer_type(value).ok_or_else(|| CodecError::UnknownType(format!("{} for \"{}\"", value, name)))?,
    };

    match tid {
        TypeId::Key => {
            let object = value
                .as_object()
                .ok_or_else(|| CodecError::JsonShape(format!("directory \"{}\" is not an object", name)))?;
            Ok(Node::Dir {
                name: name.to_string(),
                children: read_object(object)?,
            })
        }
        TypeId::Link => Ok(Node::Link {
            name: name.to_string(),
            target: meta
                .and_then(|m| m.get("link"))
                .or(Some(value))
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        tid => {
            let values = match value {
                Json::Array(items) => items
                    .iter()
                    .map(|item| json_to_value(tid, item))
                    .collect::<CodecResult<Vec<_>>>()?,
                scalar => vec![json_to_value(tid, scalar)?],
            };
            let node = Node::leaf(name, tid, values);
            let declared = meta.and_then(|m| m.get("item_size")).and_then(Json::as_u64);
            Ok(match (node, declared) {
                (
                    Node::Leaf {
                        name,
                        tid,
                        item_size,
                        values,
                    },
                    Some(size),
                ) if tid.is_text() => Node::Leaf {
                    name,
                    tid,
                    item_size: item_size.max(size as u32),
                    values,
                },
                (node, _) => node,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::Dir {
            name: String::new(),
            children: vec![
                Node::leaf("Event ID", TypeId::Uint16, vec![Value::Uint16(7)]),
                Node::Leaf {
                    name: "Name".into(),
                    tid: TypeId::String,
                    item_size: 32,
                    values: vec![Value::Str("quote \" and \\ slash".into())],
                },
                Node::leaf("Data", TypeId::Int64, vec![Value::Int64(-1), Value::Int64(1 << 40)]),
                Node::Link {
                    name: "Alias".into(),
                    target: "/Settings".into(),
                },
                Node::Dir {
                    name: "Settings".into(),
                    children: vec![
                        Node::leaf("Gain", TypeId::Float, vec![Value::Float(0.1)]),
                        Node::leaf("On", TypeId::Bool, vec![Value::Bool(true)]),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_metadata_members() {
        let json = to_json(&sample());
        assert_eq!(json["Event ID/key"], json!({ "type": 4 }));
        assert_eq!(json["Event ID"], json!(7));
        assert_eq!(json["Name/key"], json!({ "type": 12, "item_size": 32 }));
        assert_eq!(json["Data/key"]["num_values"], json!(2));
        assert_eq!(json["Alias/key"]["link"], json!("/Settings"));
        assert_eq!(json["Settings"]["On"], json!(true));
    }

    #[test]
    fn test_roundtrip_through_text() {
        let text = serde_json::to_string_pretty(&to_json(&sample())).unwrap();
        let json: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(from_json(&json).unwrap(), sample());
    }

    #[test]
    fn test_infers_types_without_metadata() {
        let json = json!({ "n": 3, "big": 5_000_000_000i64, "x": 2.5, "s": "hi", "arr": [1, 2], "d": {} });
        let Node::Dir { children, .. } = from_json(&json).unwrap() else {
            panic!("root is a directory");
        };
        assert_eq!(children[0], Node::leaf("n", TypeId::Int32, vec![Value::Int32(3)]));
        assert_eq!(children[1], Node::leaf("big", TypeId::Int64, vec![Value::Int64(5_000_000_000)]));
        assert_eq!(children[2], Node::leaf("x", TypeId::Double, vec![Value::Double(2.5)]));
        assert_eq!(children[3], Node::leaf("s", TypeId::String, vec![Value::Str("hi".into())]));
        assert_eq!(
            children[4],
            Node::leaf("arr", TypeId::Int32, vec![Value::Int32(1), Value::Int32(2)])
        );
        assert_eq!(children[5], Node::dir("d"));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(from_json(&json!([1, 2])), Err(CodecError::JsonShape(_))));
    }
}
