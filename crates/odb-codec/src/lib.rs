//! ODB Codec: subtree import and export
//!
//! Three text formats for copying a subtree of an online database in and
//! out, built only on the public `odb-core` API:
//!
//! - **ASCII**: `[path]` sections with `Name = TYPE : value` lines
//! - **XML**: `<dir>`, `<key>` and `<keyarray>` elements
//! - **JSON**: members with `"<name>/key"` metadata
//!
//! All three go through the same process-local [`Node`] tree: directories
//! become nested containers, leaves carry a type and their values in order.

pub mod ascii;
pub mod error;
pub mod json;
pub mod tree;
pub mod xml;

pub use ascii::{load_ascii, parse_ascii, save_ascii, to_ascii};
pub use error::{CodecError, CodecResult};
pub use json::{from_json, load_json, save_json, to_json};
pub use tree::{read_subtree, write_subtree, Node};
pub use xml::{load_xml, parse_xml, save_xml, to_xml};
