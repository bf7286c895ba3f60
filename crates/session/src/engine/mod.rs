// Thin wrappers over the yrs replication engine.

pub mod awareness;
pub mod document;

pub use document::{AttrValue, Attributes, Field, LiveDocument, TextRun};
