// Live replicated document: a yrs Doc with `title` and `body` texts plus
// the awareness side-channel bound to it.
//
// Offsets are UTF-16 code units so positions line up with browser editors
// and with persisted comment ranges.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tandem_common::types::DocumentContent;
use yrs::sync::Awareness;
use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact,
    Update,
};

/// Shared text fields of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Body,
}

impl Field {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Body => "body",
        }
    }
}

/// A formatting attribute value. `Clear` removes the attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    Str(String),
    Clear,
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// A contiguous run of text sharing one set of attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub attributes: Attributes,
}

pub struct LiveDocument {
    awareness: Awareness,
}

impl LiveDocument {
    pub fn new() -> Self {
        Self::from_options(Options { offset_kind: OffsetKind::Utf16, ..Default::default() })
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_options(Options {
            client_id,
            offset_kind: OffsetKind::Utf16,
            ..Default::default()
        })
    }

    fn from_options(options: Options) -> Self {
        Self { awareness: Awareness::new(Doc::with_options(options)) }
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn doc(&self) -> &Doc {
        self.awareness.doc()
    }

    pub fn client_id(&self) -> u64 {
        self.doc().client_id()
    }

    fn text(&self, field: Field) -> TextRef {
        self.doc().get_or_insert_text(field.name())
    }

    pub fn text_string(&self, field: Field) -> String {
        let text = self.text(field);
        let txn = self.doc().transact();
        text.get_string(&txn)
    }

    pub fn len(&self, field: Field) -> u32 {
        let text = self.text(field);
        let txn = self.doc().transact();
        text.len(&txn)
    }

    pub fn content(&self) -> DocumentContent {
        DocumentContent::new(self.text_string(Field::Title), self.text_string(Field::Body))
    }

    /// True when neither field holds any characters.
    pub fn is_empty(&self) -> bool {
        self.len(Field::Title) == 0 && self.len(Field::Body) == 0
    }

    /// Overwrite both fields in a single transaction and return the encoded
    /// update.
    pub fn replace_content(&self, content: &DocumentContent) -> Vec<u8> {
        let title = self.text(Field::Title);
        let body = self.text(Field::Body);
        let mut txn = self.doc().transact_mut();
        for (text, value) in [(&title, &content.title), (&body, &content.body)] {
            let current = text.len(&txn);
            if current > 0 {
                text.remove_range(&mut txn, 0, current);
            }
            if !value.is_empty() {
                text.insert(&mut txn, 0, value);
            }
        }
        txn.encode_update_v1()
    }

    pub fn insert(&self, field: Field, index: u32, chunk: &str, attributes: &Attributes) -> Vec<u8> {
        let text = self.text(field);
        let mut txn = self.doc().transact_mut();
        let units = utf16_units(&text, &txn);
        let (index, _) = snap_to_chars(&units, index, index);
        if attributes.is_empty() {
            text.insert(&mut txn, index, chunk);
        } else {
            text.insert_with_attributes(&mut txn, index, chunk, to_attrs(attributes));
        }
        txn.encode_update_v1()
    }

    /// Remove `[index, index + len)`, clamped to the field and widened so a
    /// surrogate pair is never split.
    pub fn remove(&self, field: Field, index: u32, len: u32) -> Vec<u8> {
        let text = self.text(field);
        let mut txn = self.doc().transact_mut();
        let units = utf16_units(&text, &txn);
        let (index, end) = snap_to_chars(&units, index, index.saturating_add(len));
        let len = end - index;
        if len > 0 {
            text.remove_range(&mut txn, index, len);
        }
        txn.encode_update_v1()
    }

    /// Apply attributes over `[index, index + len)`, clamped and widened the
    /// same way as [`LiveDocument::remove`].
    pub fn format(&self, field: Field, index: u32, len: u32, attributes: &Attributes) -> Vec<u8> {
        let text = self.text(field);
        let mut txn = self.doc().transact_mut();
        let units = utf16_units(&text, &txn);
        let (index, end) = snap_to_chars(&units, index, index.saturating_add(len));
        let len = end - index;
        if len > 0 && !attributes.is_empty() {
            text.format(&mut txn, index, len, to_attrs(attributes));
        }
        txn.encode_update_v1()
    }

    pub fn runs(&self, field: Field) -> Vec<TextRun> {
        let text = self.text(field);
        let txn = self.doc().transact();
        let diff: Vec<Diff<YChange>> = text.diff(&txn, YChange::identity);
        diff.into_iter()
            .map(|chunk| TextRun {
                text: chunk.insert.to_string(&txn),
                attributes: chunk.attributes.map(|attrs| from_attrs(&attrs)).unwrap_or_default(),
            })
            .collect()
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc().transact().state_vector()
    }

    /// All changes the holder of `remote` has not seen yet.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc().transact().encode_diff_v1(remote)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode update")?;
        self.doc().transact_mut().apply_update(update).context("failed to apply update")?;
        Ok(())
    }

    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }
}

impl Default for LiveDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn utf16_units<T: ReadTxn>(text: &TextRef, txn: &T) -> Vec<u16> {
    text.get_string(txn).encode_utf16().collect()
}

fn is_low_surrogate(units: &[u16], index: u32) -> bool {
    units.get(index as usize).is_some_and(|unit| (0xDC00..=0xDFFF).contains(unit))
}

/// Clamp `[start, end)` to the text and move any bound that falls between
/// the halves of a surrogate pair outward to the enclosing character.
fn snap_to_chars(units: &[u16], start: u32, end: u32) -> (u32, u32) {
    let total = units.len() as u32;
    let mut start = start.min(total);
    let mut end = end.clamp(start, total);
    if start > 0 && is_low_surrogate(units, start) {
        start -= 1;
    }
    if end < total && is_low_surrogate(units, end) {
        end += 1;
    }
    (start, end)
}

fn to_attrs(attributes: &Attributes) -> Attrs {
    attributes
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AttrValue::Bool(flag) => Any::Bool(*flag),
                AttrValue::Str(text) => Any::String(Arc::from(text.as_str())),
                AttrValue::Clear => Any::Null,
            };
            (Arc::from(key.as_str()), value)
        })
        .collect()
}

fn from_attrs(attrs: &Attrs) -> Attributes {
    attrs
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Any::Bool(flag) => AttrValue::Bool(*flag),
                Any::String(text) => AttrValue::Str(text.to_string()),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

/// Convenience for building a single-entry attribute set.
pub fn attribute(key: impl Into<String>, value: AttrValue) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(key.into(), value);
    attributes
}
