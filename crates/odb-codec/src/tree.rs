//! Process-local intermediate tree shared by all codecs
//!
//! Saving reads a subtree into a [`Node`] under one lock hold; loading
//! writes a [`Node`] back the same way. The format modules only convert
//! between text and `Node`.

use odb_core::{Database, OdbError, TypeId, Value};
use tracing::debug;

use crate::error::CodecResult;

/// One key of a subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dir {
        name: String,
        children: Vec<Node>,
    },
    Leaf {
        name: String,
        tid: TypeId,
        /// Slot width for strings; the fixed size otherwise
        item_size: u32,
        values: Vec<Value>,
    },
    Link {
        name: String,
        target: String,
    },
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Dir { name, .. } | Node::Leaf { name, .. } | Node::Link { name, .. } => name,
        }
    }

    /// An empty directory.
    pub fn dir(name: impl Into<String>) -> Self {
        Node::Dir {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Leaf with item size derived from the values.
    pub fn leaf(name: impl Into<String>, tid: TypeId, values: Vec<Value>) -> Self {
        let item_size = if tid.is_text() {
            values
                .iter()
                .map(|v| v.as_str().map_or(1, |s| s.len() as u32 + 1))
                .max()
                .unwrap_or(1)
        } else {
            tid.item_size()
        };
        Node::Leaf {
            name: name.into(),
            tid,
            item_size,
            values,
        }
    }

    /// Directory child named `name`, created if missing. `None` if `self`
    /// is not a directory or the name belongs to a non-directory.
    pub(crate) fn subdir_mut(&mut self, name: &str) -> Option<&mut Node> {
        let Node::Dir { children, .. } = self else {
            return None;
        };
        let pos = match children.iter().position(|c| c.name().eq_ignore_ascii_case(name)) {
            Some(pos) => pos,
            None => {
                children.push(Node::dir(name));
                children.len() - 1
            }
        };
        let child = &mut children[pos];
        if matches!(child, Node::Dir { .. }) {
            Some(child)
        } else {
            None
        }
    }

    pub(crate) fn push(&mut self, child: Node) {
        if let Node::Dir { children, .. } = self {
            children.push(child);
        }
    }
}

/// Read the subtree at `handle`.
pub fn read_subtree(db: &Database, handle: u32) -> CodecResult<Node> {
    db.locked(|db| read_node(db, handle))
}

fn read_node(db: &Database, handle: u32) -> CodecResult<Node> {
    let info = db.get_key(handle)?;
    let node = match info.type_id {
        TypeId::Key => {
            let mut children = Vec::with_capacity(info.num_keys as usize);
            let mut i = 0;
            while let Some(child) = db.enum_key(handle, i)? {
                children.push(read_node(db, child)?);
                i += 1;
            }
            Node::Dir {
                name: info.name,
                children,
            }
        }
        TypeId::Link => Node::Link {
            name: info.name,
            target: db.read_link(handle)?,
        },
        tid => {
            let (_, values) = db.get_values(handle)?;
            Node::Leaf {
                name: info.name,
                tid,
                item_size: info.item_size,
                values,
            }
        }
    };
    Ok(node)
}

/// Write `node` below the directory `target`. A directory node contributes
/// its children (its own name is ignored); any other node is created as a
/// child of `target`. Existing keys of the same type are overwritten.
/// Links are created last so they may point into the loaded subtree.
pub fn write_subtree(db: &Database, target: u32, node: &Node) -> CodecResult<()> {
    db.locked(|db| {
        let mut links = Vec::new();
        match node {
            Node::Dir { children, .. } => {
                for child in children {
                    write_node(db, target, child, &mut links)?;
                }
            }
            other => write_node(db, target, other, &mut links)?,
        }
        for (parent, name, link_target) in links {
            match db.create_link(parent, &name, &link_target) {
                Ok(_) | Err(OdbError::KeyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    })
}

fn write_node(db: &Database, parent: u32, node: &Node, links: &mut Vec<(u32, String, String)>) -> CodecResult<()> {
    match node {
        Node::Dir { name, children } => {
            let handle = db.create(parent, name, TypeId::Key)?;
            for child in children {
                write_node(db, handle, child, links)?;
            }
        }
        Node::Leaf {
            name,
            tid,
            item_size,
            values,
        } => {
            let handle = db.create(parent, name, *tid)?;
            if !values.is_empty() {
                db.set_values(handle, *tid, values, *item_size)?;
            }
            debug!(name = %name, tid = %tid, n = values.len(), "loaded key");
        }
        Node::Link { name, target } => links.push((parent, name.clone(), target.clone())),
    }
    Ok(())
}
