// Comment anchors: comment ranges are stored as a `comment:{id}` formatting
// attribute over the body text, so they travel with the replicated
// document and follow concurrent edits.
//
// Replay takes persisted records, keeps well-formed ones, marks them in start
// order and remembers which ids were applied in this session. Ranges are
// clamped to the current body length; one that collapses after clamping is
// reported as unanchored and left unmarked. Persisted records are never
// rewritten here.

use std::collections::HashSet;

use tandem_common::types::{AnchorError, CommentAnchor, CommentRecord};
use tracing::debug;

use crate::engine::{AttrValue, Attributes, Field, LiveDocument};

pub const COMMENT_MARK_PREFIX: &str = "comment:";

pub fn comment_mark(comment_id: &str) -> String {
    format!("{COMMENT_MARK_PREFIX}{comment_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unanchored {
    pub comment_id: String,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub marked: Vec<String>,
    pub already_applied: Vec<String>,
    pub unanchored: Vec<Unanchored>,
    /// Records dropped because their range or id was malformed.
    pub rejected: Vec<String>,
    pub updates: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct CommentAnchorManager {
    applied: HashSet<String>,
}

impl CommentAnchorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applied(&self, comment_id: &str) -> bool {
        self.applied.contains(comment_id)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Validate a selection for a new comment against the current body.
    pub fn check_range(document: &LiveDocument, start: u32, end: u32) -> Result<(), AnchorError> {
        if start >= end {
            return Err(AnchorError::DegenerateRange { start, end });
        }
        let len = document.len(Field::Body);
        if end > len {
            return Err(AnchorError::OutOfBounds { end, len });
        }
        Ok(())
    }

    /// Mark a freshly created comment. Returns `None` if the id was already
    /// applied in this session.
    pub fn attach(&mut self, document: &LiveDocument, anchor: &CommentAnchor) -> Option<Vec<u8>> {
        if self.applied.contains(anchor.comment_id()) {
            return None;
        }
        let update = mark(document, anchor.comment_id(), anchor.range_start(), anchor.len());
        self.applied.insert(anchor.comment_id().to_string());
        Some(update)
    }

    pub fn replay(&mut self, document: &LiveDocument, records: Vec<CommentRecord>) -> ReplayReport {
        let mut report = ReplayReport::default();

        let mut anchors: Vec<CommentAnchor> = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            match CommentAnchor::try_from(record) {
                Ok(anchor) => anchors.push(anchor),
                Err(error) => {
                    debug!(comment_id = %id, %error, "skipping malformed comment record");
                    report.rejected.push(id);
                }
            }
        }
        anchors.sort_by(|a, b| {
            a.range_start().cmp(&b.range_start()).then_with(|| a.comment_id().cmp(b.comment_id()))
        });

        let body_len = document.len(Field::Body);
        for anchor in anchors {
            let id = anchor.comment_id();
            if self.applied.contains(id) {
                report.already_applied.push(id.to_string());
                continue;
            }
            let start = anchor.range_start().min(body_len);
            let end = anchor.range_end().min(body_len);
            if start >= end {
                report.unanchored.push(Unanchored {
                    comment_id: id.to_string(),
                    start: anchor.range_start(),
                    end: anchor.range_end(),
                });
                continue;
            }
            report.updates.push(mark(document, id, start, end - start));
            self.applied.insert(id.to_string());
            report.marked.push(id.to_string());
        }

        report
    }

    /// Forget applied ids (session teardown).
    pub fn reset(&mut self) {
        self.applied.clear();
    }
}

fn mark(document: &LiveDocument, comment_id: &str, start: u32, len: u32) -> Vec<u8> {
    let mut attributes = Attributes::new();
    attributes.insert(comment_mark(comment_id), AttrValue::Bool(true));
    document.format(Field::Body, start, len, &attributes)
}

/// Ranges of the body currently carrying the mark for `comment_id`.
pub fn marked_ranges(document: &LiveDocument, comment_id: &str) -> Vec<(u32, u32)> {
    let key = comment_mark(comment_id);
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut offset = 0u32;
    for run in document.runs(Field::Body) {
        let len = run.text.encode_utf16().count() as u32;
        if run.attributes.contains_key(&key) {
            match ranges.last_mut() {
                Some(last) if last.1 == offset => last.1 += len,
                _ => ranges.push((offset, offset + len)),
            }
        }
        offset += len;
    }
    ranges
}
