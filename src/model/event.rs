//! Event records and read options for the event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable entry in a subject's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Stream key (e.g. `run:<runId>`, `trigger:<name>`).
    pub subject: String,
    /// Strictly increasing and gap-free within the subject, starting at 1.
    pub id: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Event data handed to `append`. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub kind: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn causation(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub(crate) fn into_record(self, subject: &str, id: u64) -> EventRecord {
        EventRecord {
            subject: subject.to_string(),
            id,
            kind: self.kind,
            payload: self.payload,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

/// Slice selection for `read`. `from_id` is an exclusive cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub limit: usize,
    pub from_id: Option<u64>,
    pub direction: Direction,
}

impl ReadOptions {
    pub fn forward(limit: usize) -> Self {
        Self {
            limit,
            from_id: None,
            direction: Direction::Forward,
        }
    }

    pub fn backward(limit: usize) -> Self {
        Self {
            limit,
            from_id: None,
            direction: Direction::Backward,
        }
    }

    pub fn after(mut self, id: u64) -> Self {
        self.from_id = Some(id);
        self
    }

    /// Positions of the requested page in a stream of `len` records whose
    /// ids run contiguously from 1. The range is ascending in both directions.
    pub(crate) fn span(&self, len: usize) -> std::ops::Range<usize> {
        let cursor = self.from_id.map(|id| usize::try_from(id).unwrap_or(usize::MAX));
        match self.direction {
            Direction::Forward => {
                let start = cursor.unwrap_or(0).min(len);
                start..start.saturating_add(self.limit).min(len)
            }
            Direction::Backward => {
                let end = cursor.map_or(len, |id| id.saturating_sub(1)).min(len);
                end.saturating_sub(self.limit)..end
            }
        }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::forward(100)
    }
}

/// A member of a sorted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub member: String,
    pub score: f64,
}

/// Range selection for `index_read`, ordered by ascending score unless `reverse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRange {
    pub offset: usize,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl IndexRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
            reverse: false,
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Apply this range to entries already sorted ascending by score.
    pub(crate) fn apply(&self, mut entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
        if self.reverse {
            entries.reverse();
        }
        let iter = entries.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Sort index entries by score, breaking ties by member for a stable order.
pub(crate) fn sort_entries(entries: &mut [IndexEntry]) {
    entries.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_span_starts_after_the_cursor() {
        assert_eq!(ReadOptions::forward(3).span(10), 0..3);
        assert_eq!(ReadOptions::forward(3).after(4).span(10), 4..7);
        assert_eq!(ReadOptions::forward(3).after(9).span(10), 9..10);
        assert_eq!(ReadOptions::forward(3).after(12).span(10), 10..10);
    }

    #[test]
    fn backward_span_ends_before_the_cursor() {
        assert_eq!(ReadOptions::backward(3).span(10), 7..10);
        assert_eq!(ReadOptions::backward(3).after(5).span(10), 1..4);
        assert_eq!(ReadOptions::backward(3).after(2).span(10), 0..1);
        assert_eq!(ReadOptions::backward(3).after(1).span(10), 0..0);
        assert_eq!(ReadOptions::backward(3).span(0), 0..0);
    }
}
