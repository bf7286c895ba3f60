// Document and comment contracts exchanged with the persistence collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Title + body as stored by the persistence collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentContent {
    pub title: String,
    pub body: String,
}

impl DocumentContent {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { title: title.into(), body: body.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.body.is_empty()
    }
}

/// A persisted snapshot. Only ever used to seed a replicated document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub document_id: String,
    #[serde(flatten)]
    pub content: DocumentContent,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A comment as returned by the comment collaborator's `list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub id: String,
    pub start: u32,
    pub end: u32,
    pub created_at: DateTime<Utc>,
}

/// Body of the comment collaborator's `create`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewComment {
    pub start: u32,
    pub end: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedComment {
    pub id: String,
}

/// A comment attached to `[range_start, range_end)` of the live document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentAnchor {
    comment_id: String,
    range_start: u32,
    range_end: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error("comment range [{start}, {end}) is empty or inverted")]
    DegenerateRange { start: u32, end: u32 },
    #[error("comment range ends at {end}, past the document length {len}")]
    OutOfBounds { end: u32, len: u32 },
    #[error("comment id must not be empty")]
    MissingId,
}

impl CommentAnchor {
    pub fn new(
        comment_id: impl Into<String>,
        range_start: u32,
        range_end: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Self, AnchorError> {
        let comment_id = comment_id.into();
        if comment_id.is_empty() {
            return Err(AnchorError::MissingId);
        }
        if range_start >= range_end {
            return Err(AnchorError::DegenerateRange { start: range_start, end: range_end });
        }
        Ok(Self { comment_id, range_start, range_end, created_at })
    }

    pub fn comment_id(&self) -> &str {
        &self.comment_id
    }

    pub fn range_start(&self) -> u32 {
        self.range_start
    }

    pub fn range_end(&self) -> u32 {
        self.range_end
    }

    pub fn len(&self) -> u32 {
        self.range_end - self.range_start
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl TryFrom<CommentRecord> for CommentAnchor {
    type Error = AnchorError;

    fn try_from(record: CommentRecord) -> Result<Self, Self::Error> {
        Self::new(record.id, record.start, record.end, record.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp")
    }

    #[test]
    fn anchor_requires_start_before_end() {
        assert!(CommentAnchor::new("c1", 10, 25, at()).is_ok());
        assert_eq!(
            CommentAnchor::new("c1", 25, 25, at()),
            Err(AnchorError::DegenerateRange { start: 25, end: 25 })
        );
        assert_eq!(
            CommentAnchor::new("c1", 30, 25, at()),
            Err(AnchorError::DegenerateRange { start: 30, end: 25 })
        );
        assert_eq!(CommentAnchor::new("", 1, 2, at()), Err(AnchorError::MissingId));
    }

    #[test]
    fn snapshot_flattens_content_fields() {
        let snapshot = DocumentSnapshot {
            document_id: "doc-1".to_string(),
            content: DocumentContent::new("Title", "<p>Body</p>"),
            updated_at: None,
        };
        let value = serde_json::to_value(&snapshot).expect("snapshot should serialize");
        assert_eq!(value["documentId"], "doc-1");
        assert_eq!(value["title"], "Title");
        assert_eq!(value["body"], "<p>Body</p>");
    }

    #[test]
    fn comment_record_uses_camel_case_timestamps() {
        let record: CommentRecord = serde_json::from_str(
            r#"{"id":"c1","start":10,"end":25,"createdAt":"2026-03-01T09:00:00Z"}"#,
        )
        .expect("record should parse");
        assert_eq!(record.created_at, at());
        let anchor = CommentAnchor::try_from(record).expect("valid anchor");
        assert_eq!(anchor.len(), 15);
    }
}
