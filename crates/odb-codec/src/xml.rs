//! XML codec
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <odb>
//!   <key name="Event ID" type="WORD">7</key>
//!   <key name="Name" type="STRING" size="32">Sample</key>
//!   <keyarray name="Data" type="INT" num_values="2">
//!     <value index="0">1</value>
//!     <value index="1">2</value>
//!   </keyarray>
//!   <key name="Alias" type="LINK">/Equipment/Test</key>
//!   <dir name="Settings">
//!     <key name="Gain" type="DOUBLE">1.5</key>
//!   </dir>
//! </odb>
//! ```
//!
//! Text content is escaped with the standard XML entities.

use std::io::Cursor;

use odb_core::{Database, TypeId, Value};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{CodecError, CodecResult};
use crate::tree::{read_subtree, write_subtree, Node};

/// Export the subtree at `handle`.
pub fn save_xml(db: &Database, handle: u32) -> CodecResult<String> {
    to_xml(&read_subtree(db, handle)?)
}

/// Import `text` below the directory `target`.
pub fn load_xml(db: &Database, target: u32, text: &str) -> CodecResult<()> {
    write_subtree(db, target, &parse_xml(text)?)
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

pub fn to_xml(node: &Node) -> CodecResult<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("odb")))?;
    match node {
        Node::Dir { children, .. } => {
            for child in children {
                write_node(&mut writer, child)?;
            }
        }
        other => write_node(&mut writer, other)?,
    }
    writer.write_event(Event::End(BytesEnd::new("odb")))?;
    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| CodecError::Xml(e.to_string()))
}

fn write_text_element(writer: &mut XmlWriter, start: BytesStart<'_>, text: &str) -> CodecResult<()> {
    let end = start.to_end().into_owned();
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(end))?;
    Ok(())
}

fn write_node(writer: &mut XmlWriter, node: &Node) -> CodecResult<()> {
    match node {
        Node::Dir { name, children } => {
            writer.write_event(Event::Start(BytesStart::new("dir").with_attributes([("name", name.as_str())])))?;
            for child in children {
                write_node(writer, child)?;
            }
            writer.write_event(Event::End(BytesEnd::new("dir")))?;
        }
        Node::Link { name, target } => {
            let start = BytesStart::new("key").with_attributes([("name", name.as_str()), ("type", "LINK")]);
            write_text_element(writer, start, target)?;
        }
        Node::Leaf {
            name,
            tid,
            item_size,
            values,
        } => {
            let size = item_size.to_string();
            let mut attrs = vec![("name", name.as_str()), ("type", tid.name())];
            if tid.is_text() {
                attrs.push(("size", size.as_str()));
            }
            if values.len() == 1 {
                write_text_element(writer, BytesStart::new("key").with_attributes(attrs), &values[0].to_string())?;
            } else {
                let count = values.len().to_string();
                attrs.push(("num_values", count.as_str()));
                writer.write_event(Event::Start(BytesStart::new("keyarray").with_attributes(attrs)))?;
                for (i, value) in values.iter().enumerate() {
                    let index = i.to_string();
                    let start = BytesStart::new("value").with_attributes([("index", index.as_str())]);
                    write_text_element(writer, start, &value.to_string())?;
                }
                writer.write_event(Event::End(BytesEnd::new("keyarray")))?;
            }
        }
    }
    Ok(())
}

/// A `key` or `keyarray` element being read.
struct PendingKey {
    name: String,
    tid: TypeId,
    size: Option<u32>,
    values: Vec<Value>,
}

fn attr(e: &BytesStart<'_>, name: &str) -> CodecResult<Option<String>> {
    Ok(match e.try_get_attribute(name)? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    })
}

fn required(e: &BytesStart<'_>, name: &str) -> CodecResult<String> {
    let element = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    attr(e, name)?.ok_or_else(|| CodecError::Xml(format!("<{}> without {} attribute", element, name)))
}

fn pending_key(e: &BytesStart<'_>) -> CodecResult<PendingKey> {
    let type_name = required(e, "type")?;
    let tid = TypeId::from_name(&type_name).ok_or(CodecError::UnknownType(type_name))?;
    let size = match attr(e, "size")? {
        Some(s) => Some(s.parse().map_err(|_| CodecError::Xml(format!("bad size \"{}\"", s)))?),
        None => None,
    };
    Ok(PendingKey {
        name: required(e, "name")?,
        tid,
        size,
        values: Vec::new(),
    })
}

fn parse_value(tid: TypeId, text: &str) -> CodecResult<Value> {
    Ok(Value::parse(tid, text)?)
}

fn finish(key: PendingKey) -> Node {
    if key.tid == TypeId::Link {
        return Node::Link {
            name: key.name,
            target: key.values.into_iter().next().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
        };
    }
    match Node::leaf(key.name, key.tid, key.values) {
        Node::Leaf {
            name,
            tid,
            item_size,
            values,
        } => Node::Leaf {
            name,
            tid,
            item_size: key.size.map_or(item_size, |s| s.max(item_size)),
            values,
        },
        node => node,
    }
}

pub fn parse_xml(text: &str) -> CodecResult<Node> {
    let mut reader = Reader::from_str(text);
    // Directories being built; the first entry is the <odb> root.
    let mut stack: Vec<Node> = Vec::new();
    let mut key: Option<PendingKey> = None;
    let mut in_array = false;
    let mut buf = String::new();
    let mut done: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"odb" => stack.push(Node::dir("")),
                b"dir" => stack.push(Node::dir(required(e, "name")?)),
                b"key" => {
                    key = Some(pending_key(e)?);
                    in_array = false;
                    buf.clear();
                }
                b"keyarray" => {
                    key = Some(pending_key(e)?);
                    in_array = true;
                }
                b"value" => buf.clear(),
                other => {
                    return Err(CodecError::Xml(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(ref e) => match e.name().as_ref() {
                b"dir" => {
                    let dir = Node::dir(required(e, "name")?);
                    stack.last_mut().ok_or_else(|| CodecError::Xml("<dir> outside <odb>".into()))?.push(dir);
                }
                b"key" => {
                    let mut pending = pending_key(e)?;
                    pending.values.push(parse_value(pending.tid, "")?);
                    stack
                        .last_mut()
                        .ok_or_else(|| CodecError::Xml("<key> outside <odb>".into()))?
                        .push(finish(pending));
                }
                b"value" => {
                    let pending = key.as_mut().ok_or_else(|| CodecError::Xml("<value> outside <keyarray>".into()))?;
                    pending.values.push(parse_value(pending.tid, "")?);
                }
                b"odb" => done = Some(Node::dir("")),
                other => {
                    return Err(CodecError::Xml(format!(
                        "unexpected element <{}/>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Text(ref e) => {
                if key.is_some() {
                    buf.push_str(&e.unescape()?);
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"key" | b"keyarray" => {
                    let mut pending = key.take().ok_or_else(|| CodecError::Xml("unbalanced </key>".into()))?;
                    if !in_array {
                        pending.values.push(parse_value(pending.tid, &buf)?);
                    }
                    in_array = false;
                    stack
                        .last_mut()
                        .ok_or_else(|| CodecError::Xml("<key> outside <odb>".into()))?
                        .push(finish(pending));
                }
                b"value" => {
                    let pending = key.as_mut().ok_or_else(|| CodecError::Xml("<value> outside <keyarray>".into()))?;
                    pending.values.push(parse_value(pending.tid, &buf)?);
                    buf.clear();
                }
                b"dir" => {
                    let dir = stack.pop().ok_or_else(|| CodecError::Xml("unbalanced </dir>".into()))?;
                    stack
                        .last_mut()
                        .ok_or_else(|| CodecError::Xml("<dir> outside <odb>".into()))?
                        .push(dir);
                }
                b"odb" => done = stack.pop(),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    done.ok_or_else(|| CodecError::Xml("missing <odb> element".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::Dir {
            name: "".into(),
            children: vec![
                Node::leaf("Event ID", TypeId::Uint16, vec![Value::Uint16(7)]),
                Node::Leaf {
                    name: "Comment".into(),
                    tid: TypeId::String,
                    item_size: 64,
                    values: vec![Value::Str("a < b & \"c\"".into())],
                },
                Node::leaf("Data", TypeId::Double, vec![Value::Double(0.5), Value::Double(-1.25)]),
                Node::Link {
                    name: "Alias".into(),
                    target: "/Settings".into(),
                },
                Node::Dir {
                    name: "Settings".into(),
                    children: vec![
                        Node::leaf("Mask", TypeId::Bitfield, vec![Value::Bitfield(0xff)]),
                        Node::dir("Empty"),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_writes_expected_elements() {
        let xml = to_xml(&sample()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<key name=\"Event ID\" type=\"WORD\">7</key>"));
        assert!(xml.contains("a &lt; b &amp; &quot;c&quot;"));
        assert!(xml.contains("<keyarray name=\"Data\" type=\"DOUBLE\" num_values=\"2\">"));
        assert!(xml.contains("<value index=\"1\">-1.25</value>"));
        assert!(xml.contains("<dir name=\"Settings\">"));
    }

    #[test]
    fn test_parse_restores_tree() {
        assert_eq!(parse_xml(&to_xml(&sample()).unwrap()).unwrap(), sample());
    }

    #[test]
    fn test_empty_string_and_self_closing() {
        let xml = r#"<odb><key name="S" type="STRING" size="8"/><dir name="D"/></odb>"#;
        let Node::Dir { children, .. } = parse_xml(xml).unwrap() else {
            panic!("root is a directory");
        };
        assert_eq!(
            children[0],
            Node::Leaf {
                name: "S".into(),
                tid: TypeId::String,
                item_size: 8,
                values: vec![Value::Str(String::new())],
            }
        );
        assert_eq!(children[1], Node::dir("D"));
    }

    #[test]
    fn test_rejects_unknown_type_and_missing_root() {
        assert!(matches!(
            parse_xml(r#"<odb><key name="x" type="BLOB">1</key></odb>"#),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(parse_xml(""), Err(CodecError::Xml(_))));
    }
}
