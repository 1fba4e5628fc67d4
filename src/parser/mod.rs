//! Detail document parsing: the Atom entry itself, and the step markup
//! embedded in its content.

pub mod content;
pub mod entry;

pub use entry::{origin_id, parse_entry};
