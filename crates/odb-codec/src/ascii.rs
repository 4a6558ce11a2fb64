//! ASCII codec: one `[path]` section per directory
//!
//! ```text
//! [.]
//! Event ID = WORD : 7
//! Name = STRING : [32] Sample
//! Data = INT[3] :
//! [0] 1
//! [1] 2
//! [2] 3
//! Alias = LINK : /Equipment/Test
//!
//! [Settings]
//! Gain = DOUBLE : 1.5
//! ```
//!
//! Section paths are relative to the saved key (`.` is the key itself).
//! String slots carry their width in brackets; backslash, newline and
//! carriage return are escaped as `\\`, `\n`, `\r`.

use std::fmt::Write as _;

use odb_core::{split_index, Database, TypeId, Value};

use crate::error::{CodecError, CodecResult};
use crate::tree::{read_subtree, write_subtree, Node};

/// Export the subtree at `handle`.
pub fn save_ascii(db: &Database, handle: u32) -> CodecResult<String> {
    Ok(to_ascii(&read_subtree(db, handle)?))
}

/// Import `text` below the directory `target`.
pub fn load_ascii(db: &Database, target: u32, text: &str) -> CodecResult<()> {
    write_subtree(db, target, &parse_ascii(text)?)
}

pub fn to_ascii(node: &Node) -> String {
    let mut out = String::new();
    match node {
        Node::Dir { children, .. } => write_section(&mut out, ".", children),
        other => write_section(&mut out, ".", std::slice::from_ref(other)),
    }
    out
}

fn write_section(out: &mut String, path: &str, children: &[Node]) {
    let _ = writeln!(out, "[{}]", path);
    for child in children {
        match child {
            Node::Dir { .. } => {}
            Node::Link { name, target } => {
                let _ = writeln!(out, "{} = LINK : {}", name, escape(target));
            }
            Node::Leaf {
                name,
                tid,
                item_size,
                values,
            } => write_leaf(out, name, *tid, *item_size, values),
        }
    }
    out.push('\n');
    for child in children {
        if let Node::Dir { name, children } = child {
            let sub = if path == "." {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };
            write_section(out, &sub, children);
        }
    }
}

fn write_leaf(out: &mut String, name: &str, tid: TypeId, item_size: u32, values: &[Value]) {
    let width = if tid.is_text() {
        format!("[{}] ", item_size)
    } else {
        String::new()
    };
    if values.len() == 1 {
        let _ = writeln!(out, "{} = {} : {}{}", name, tid.name(), width, format_value(&values[0]));
        return;
    }
    let _ = writeln!(out, "{} = {}[{}] : {}", name, tid.name(), values.len(), width.trim_end());
    for (i, value) in values.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", i, format_value(value));
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Str(s) => escape(s),
        other => other.to_string(),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `[n] rest` -> `(n, rest)`
fn bracket_prefix(text: &str) -> Option<(u32, &str)> {
    let inner = text.strip_prefix('[')?;
    let close = inner.find(']')?;
    let n = inner[..close].trim().parse().ok()?;
    let rest = &inner[close + 1..];
    Some((n, rest.strip_prefix(' ').unwrap_or(rest)))
}

pub fn parse_ascii(text: &str) -> CodecResult<Node> {
    let mut root = Node::dir("");
    let mut section: Vec<String> = Vec::new();
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    while let Some((line_no, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        let err = |reason: &str| CodecError::Parse {
            line: line_no,
            reason: reason.to_string(),
        };

        if let Some(path) = trimmed.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            section = path
                .split('/')
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != ".")
                .map(str::to_string)
                .collect();
            dir_at(&mut root, &section).ok_or_else(|| err("section path crosses a non-directory"))?;
            continue;
        }

        let (name, rest) = line.split_once(" = ").ok_or_else(|| err("expected `name = TYPE : value`"))?;
        let (type_spec, value_text) = match rest.split_once(" :") {
            Some((t, v)) => (t, v.strip_prefix(' ').unwrap_or(v)),
            None => return Err(err("missing ':' after type")),
        };
        let (type_name, count) = split_index(type_spec.trim()).map_err(|e| err(&e.to_string()))?;
        let tid = TypeId::from_name(type_name).ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        let name = name.trim().to_string();

        let node = if tid == TypeId::Link {
            Node::Link {
                name,
                target: unescape(value_text),
            }
        } else if tid.is_dir() {
            Node::dir(name)
        } else {
            let (width, value_text) = if tid.is_text() {
                match bracket_prefix(value_text) {
                    Some((w, rest)) => (Some(w), rest),
                    None if value_text.trim().is_empty() => (None, ""),
                    None => (None, value_text),
                }
            } else {
                (None, value_text)
            };

            let values = match count {
                None => vec![parse_value(tid, value_text).map_err(|e| err(&e))?],
                Some(n) => {
                    let mut values = Vec::with_capacity(n as usize);
                    for expected in 0..n {
                        let (item_line, item) = lines
                            .next()
                            .ok_or_else(|| err(&format!("array ends before element {}", expected)))?;
                        let (index, item_text) = bracket_prefix(item.trim_start()).ok_or_else(|| CodecError::Parse {
                            line: item_line,
                            reason: "expected `[index] value`".into(),
                        })?;
                        if index != expected {
                            return Err(CodecError::Parse {
                                line: item_line,
                                reason: format!("element {} out of order, expected {}", index, expected),
                            });
                        }
                        values.push(parse_value(tid, item_text).map_err(|reason| CodecError::Parse {
                            line: item_line,
                            reason,
                        })?);
                    }
                    values
                }
            };

            match (Node::leaf(name, tid, values), width) {
                (Node::Leaf { name, tid, item_size, values }, Some(w)) => Node::Leaf {
                    name,
                    tid,
                    item_size: item_size.max(w),
                    values,
                },
                (node, _) => node,
            }
        };

        dir_at(&mut root, &section)
            .ok_or_else(|| err("section path crosses a non-directory"))?
            .push(node);
    }
    Ok(root)
}

fn parse_value(tid: TypeId, text: &str) -> Result<Value, String> {
    if tid.is_text() {
        return Ok(Value::Str(unescape(text)));
    }
    Value::parse(tid, text).map_err(|e| e.to_string())
}

fn dir_at<'a>(root: &'a mut Node, path: &[String]) -> Option<&'a mut Node> {
    let mut node = root;
    for segment in path {
        node = node.subdir_mut(segment)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::Dir {
            name: "Test".into(),
            children: vec![
                Node::leaf("Event ID", TypeId::Uint16, vec![Value::Uint16(7)]),
                Node::Leaf {
                    name: "Name".into(),
                    tid: TypeId::String,
                    item_size: 32,
                    values: vec![Value::Str("two\nlines \\ ok".into())],
                },
                Node::leaf("Data", TypeId::Int32, vec![Value::Int32(1), Value::Int32(-2), Value::Int32(3)]),
                Node::Link {
                    name: "Alias".into(),
                    target: "/Test/Settings".into(),
                },
                Node::Dir {
                    name: "Settings".into(),
                    children: vec![
                        Node::leaf("Enabled", TypeId::Bool, vec![Value::Bool(true)]),
                        Node::Dir {
                            name: "Empty".into(),
                            children: vec![],
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_format_layout() {
        let text = to_ascii(&sample());
        assert!(text.starts_with("[.]\nEvent ID = WORD : 7\nName = STRING : [32] two\\nlines \\\\ ok\n"));
        assert!(text.contains("Data = INT[3] :\n[0] 1\n[1] -2\n[2] 3\n"));
        assert!(text.contains("Alias = LINK : /Test/Settings\n"));
        assert!(text.contains("\n[Settings]\nEnabled = BOOL : y\n"));
        assert!(text.contains("[Settings/Empty]\n"));
    }

    #[test]
    fn test_parse_restores_tree() {
        let parsed = parse_ascii(&to_ascii(&sample())).unwrap();
        let Node::Dir { children, .. } = parsed else {
            panic!("root is a directory");
        };
        let Node::Dir { children: expected, .. } = sample() else {
            unreachable!()
        };
        assert_eq!(children, expected);
    }

    #[test]
    fn test_names_with_separators_reimport() {
        let dir = Node::Dir {
            name: "Odd".into(),
            children: vec![
                Node::leaf("a=b", TypeId::Int32, vec![Value::Int32(1)]),
                Node::leaf("Rate # per s", TypeId::Int32, vec![Value::Int32(2)]),
                Node::leaf("x : y", TypeId::Int32, vec![Value::Int32(3)]),
            ],
        };
        let Node::Dir { children, .. } = parse_ascii(&to_ascii(&dir)).unwrap() else {
            panic!("root is a directory");
        };
        let names: Vec<&str> = children.iter().map(Node::name).collect();
        assert_eq!(names, vec!["a=b", "Rate # per s", "x : y"]);
    }

    #[test]
    fn test_parse_accepts_aliases_and_hex() {
        let text = "[.]\nMask = UINT32 : 0x10\nFlag = BOOL : n\n";
        let Node::Dir { children, .. } = parse_ascii(text).unwrap() else {
            panic!("root is a directory");
        };
        assert_eq!(children[0], Node::leaf("Mask", TypeId::Uint32, vec![Value::Uint32(16)]));
        assert_eq!(children[1], Node::leaf("Flag", TypeId::Bool, vec![Value::Bool(false)]));
    }

    #[test]
    fn test_parse_errors_carry_line() {
        match parse_ascii("[.]\nGood = INT : 1\nBad = INT : nope\n") {
            Err(CodecError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(matches!(
            parse_ascii("[.]\nX = WIDGET : 1\n"),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(
            parse_ascii("[.]\nA = INT[2] :\n[0] 1\n"),
            Err(CodecError::Parse { .. })
        ));
    }
}
