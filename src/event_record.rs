// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event record data structure.
//!
//! The [`EventRecord`] is the unit that flows from the source, through the
//! crawler and writer, into both stores. Records are keyed by `event_id`
//! and every store write is an upsert, so replaying a record is harmless.
//!
//! Sources hand over loosely-typed [`RawEvent`]s. [`normalize`] turns one
//! into an `EventRecord` or rejects it with a [`RecordError`]; rejections
//! are data errors, contained to the single record.
//!
//! # Example
//!
//! ```
//! use archive_sync::event_record::{normalize, RawEvent};
//!
//! let raw = RawEvent {
//!     id: "175928847299117063".into(),
//!     author_id: "80351110224678912".into(),
//!     content: Some("hello".into()),
//!     created_at: "2016-04-30T11:18:25.796Z".into(),
//!     ..Default::default()
//! };
//!
//! let record = normalize(&raw, 42).unwrap();
//! assert_eq!(record.event_id, 175928847299117063);
//! assert_eq!(record.created_at, 1_462_015_105_796);
//! ```

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type EventId = u64;
pub type ChannelId = u64;

/// Upper bound on stored content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid {field} '{value}'")]
    InvalidId { field: &'static str, value: String },
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("malformed attachments: {0}")]
    MalformedAttachments(String),
    #[error("attachment {index} has an empty {field}")]
    EmptyAttachmentField { index: usize, field: &'static str },
    #[error("malformed reactions: {0}")]
    MalformedReactions(String),
    #[error("content is {len} bytes (max {max})")]
    ContentTooLong { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One archived event. Field order is part of the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub channel_id: ChannelId,
    pub author_id: u64,
    pub content: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reaction_count: u64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub thread_id: Option<u64>,
}

impl EventRecord {
    /// Minimal record, mostly for tests and synthetic data.
    pub fn new(event_id: EventId, channel_id: ChannelId, author_id: u64, created_at: i64) -> Self {
        Self {
            event_id,
            channel_id,
            author_id,
            content: None,
            created_at,
            edited_at: None,
            attachments: Vec::new(),
            reaction_count: 0,
            is_deleted: false,
            thread_id: None,
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Structural checks every store applies before accepting a record.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.event_id == 0 {
            return Err(RecordError::InvalidId {
                field: "event_id",
                value: "0".into(),
            });
        }
        if let Some(content) = &self.content {
            if content.len() > MAX_CONTENT_BYTES {
                return Err(RecordError::ContentTooLong {
                    len: content.len(),
                    max: MAX_CONTENT_BYTES,
                });
            }
        }
        for (index, a) in self.attachments.iter().enumerate() {
            if a.url.trim().is_empty() {
                return Err(RecordError::EmptyAttachmentField { index, field: "url" });
            }
            if a.filename.trim().is_empty() {
                return Err(RecordError::EmptyAttachmentField { index, field: "filename" });
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// Two stores holding the same record produce the same hash.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// An event as the source delivers it: string IDs, RFC 3339 timestamps and
/// loosely-shaped attachments and reactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub edited_at: Option<String>,
    #[serde(default)]
    pub attachments: Value,
    #[serde(default)]
    pub reactions: Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Convert a raw source event into a validated record.
pub fn normalize(raw: &RawEvent, channel_id: ChannelId) -> Result<EventRecord, RecordError> {
    let record = EventRecord {
        event_id: parse_id("event_id", &raw.id)?,
        channel_id,
        author_id: parse_id("author_id", &raw.author_id)?,
        content: raw.content.clone(),
        created_at: parse_timestamp(&raw.created_at)?,
        edited_at: raw.edited_at.as_deref().map(parse_timestamp).transpose()?,
        attachments: parse_attachments(&raw.attachments)?,
        reaction_count: parse_reactions(&raw.reactions)?,
        is_deleted: raw.deleted,
        thread_id: raw
            .thread_id
            .as_deref()
            .map(|t| parse_id("thread_id", t))
            .transpose()?,
    };
    record.validate()?;
    Ok(record)
}

fn parse_id(field: &'static str, value: &str) -> Result<u64, RecordError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| RecordError::InvalidId {
            field,
            value: value.to_string(),
        })
}

fn parse_timestamp(value: &str) -> Result<i64, RecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| RecordError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_attachments(value: &Value) -> Result<Vec<Attachment>, RecordError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value.clone())
            .map_err(|e| RecordError::MalformedAttachments(e.to_string())),
        other => Err(RecordError::MalformedAttachments(format!(
            "expected an array, got {other}"
        ))),
    }
}

/// Reactions arrive either as a total or as a list of `{"count": n}` entries.
fn parse_reactions(value: &Value) -> Result<u64, RecordError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RecordError::MalformedReactions(n.to_string())),
        Value::Array(entries) => entries.iter().try_fold(0u64, |acc, entry| {
            let count = entry
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| RecordError::MalformedReactions(entry.to_string()))?;
            Ok(acc.saturating_add(count))
        }),
        other => Err(RecordError::MalformedReactions(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str) -> RawEvent {
        RawEvent {
            id: id.to_string(),
            author_id: "7".into(),
            content: Some("hi".into()),
            created_at: "2024-01-02T03:04:05.678+00:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_basic() {
        let r = normalize(&raw("123"), 9).unwrap();
        assert_eq!(r.event_id, 123);
        assert_eq!(r.channel_id, 9);
        assert_eq!(r.author_id, 7);
        assert_eq!(r.created_at, 1_704_164_645_678);
        assert!(r.attachments.is_empty());
        assert_eq!(r.reaction_count, 0);
    }

    #[test]
    fn test_normalize_sums_reactions() {
        let mut e = raw("1");
        e.reactions = json!([{"emoji": "a", "count": 3}, {"emoji": "b", "count": 4}]);
        assert_eq!(normalize(&e, 1).unwrap().reaction_count, 7);

        e.reactions = json!(5);
        assert_eq!(normalize(&e, 1).unwrap().reaction_count, 5);
    }

    #[test]
    fn test_normalize_parses_attachments() {
        let mut e = raw("1");
        e.attachments = json!([{"url": "https://x/a.png", "filename": "a.png", "size": 10}]);
        let r = normalize(&e, 1).unwrap();
        assert_eq!(r.attachments.len(), 1);
        assert_eq!(r.attachments[0].size, Some(10));
    }

    #[test]
    fn test_normalize_rejects_malformed_attachments() {
        let mut e = raw("1");
        e.attachments = json!({"url": "not-a-list"});
        assert!(matches!(normalize(&e, 1), Err(RecordError::MalformedAttachments(_))));

        e.attachments = json!([{"filename": "missing-url"}]);
        assert!(matches!(normalize(&e, 1), Err(RecordError::MalformedAttachments(_))));
    }

    #[test]
    fn test_normalize_rejects_bad_ids_and_timestamps() {
        assert!(matches!(normalize(&raw("abc"), 1), Err(RecordError::InvalidId { .. })));
        assert!(matches!(normalize(&raw("0"), 1), Err(RecordError::InvalidId { .. })));

        let mut e = raw("1");
        e.created_at = "yesterday".into();
        assert!(matches!(normalize(&e, 1), Err(RecordError::InvalidTimestamp { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_attachment_url() {
        let r = EventRecord::new(1, 1, 1, 0).with_attachment(Attachment {
            url: " ".into(),
            filename: "f".into(),
            content_type: None,
            size: None,
        });
        assert_eq!(
            r.validate(),
            Err(RecordError::EmptyAttachmentField { index: 0, field: "url" })
        );
    }

    #[test]
    fn test_validate_rejects_oversized_content() {
        let r = EventRecord::new(1, 1, 1, 0).with_content("x".repeat(MAX_CONTENT_BYTES + 1));
        assert!(matches!(r.validate(), Err(RecordError::ContentTooLong { .. })));
    }

    #[test]
    fn test_content_hash_tracks_content() {
        let a = EventRecord::new(1, 1, 1, 0).with_content("a");
        let b = a.clone();
        let c = EventRecord::new(1, 1, 1, 0).with_content("c");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
