//! Append-only event streams.

use chrono::{DateTime, Utc};

use super::listener::channel_for;
use crate::error::Result;
use crate::model::event::{Direction, EventRecord, NewEvent, ReadOptions};
use crate::store::Notice;

impl super::Db {
    /// Assign the next id for `subject`, insert the record and notify, all in
    /// one transaction. The `event_streams` row lock serializes appenders.
    pub async fn append_event(&self, subject: &str, event: NewEvent) -> Result<EventRecord> {
        let mut tx = self.pool.begin().await?;

        let (next_id,): (i64,) = sqlx::query_as(
            "INSERT INTO event_streams (subject, last_id) VALUES ($1, 1)
             ON CONFLICT (subject) DO UPDATE SET last_id = event_streams.last_id + 1
             RETURNING last_id",
        )
        .bind(subject)
        .fetch_one(&mut *tx)
        .await?;

        let record = event.into_record(subject, next_id as u64);
        sqlx::query(
            "INSERT INTO events (subject, id, kind, payload, correlation_id, causation_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(subject)
        .bind(next_id)
        .bind(&record.kind)
        .bind(&record.payload)
        .bind(&record.correlation_id)
        .bind(&record.causation_id)
        .bind(record.timestamp)
        .execute(&mut *tx)
        .await?;

        let notice = serde_json::to_string(&Notice {
            subject: subject.to_string(),
            id: record.id,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel_for(subject))
            .bind(notice)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn read_events(&self, subject: &str, opts: &ReadOptions) -> Result<Vec<EventRecord>> {
        let limit = opts.limit.min(i64::MAX as usize) as i64;
        let rows: Vec<EventRow> = match (opts.direction, opts.from_id) {
            (Direction::Forward, from) => {
                sqlx::query_as(
                    "SELECT subject, id, kind, payload, correlation_id, causation_id, created_at
                     FROM events WHERE subject = $1 AND id > $2
                     ORDER BY id ASC LIMIT $3",
                )
                .bind(subject)
                .bind(from.unwrap_or(0) as i64)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Direction::Backward, Some(from)) => {
                sqlx::query_as(
                    "SELECT subject, id, kind, payload, correlation_id, causation_id, created_at
                     FROM events WHERE subject = $1 AND id < $2
                     ORDER BY id DESC LIMIT $3",
                )
                .bind(subject)
                .bind(from as i64)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Direction::Backward, None) => {
                sqlx::query_as(
                    "SELECT subject, id, kind, payload, correlation_id, causation_id, created_at
                     FROM events WHERE subject = $1
                     ORDER BY id DESC LIMIT $2",
                )
                .bind(subject)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(EventRow::into_record).collect())
    }

    pub async fn count_events(&self, subject: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE subject = $1")
            .bind(subject)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Drop every record of `subject`. Ids restart at 1 afterwards.
    pub async fn delete_events(&self, subject: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event_streams WHERE subject = $1")
            .bind(subject)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE subject = $1")
            .bind(subject)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    subject: String,
    id: i64,
    kind: String,
    payload: serde_json::Value,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_record(self) -> EventRecord {
        EventRecord {
            subject: self.subject,
            id: self.id as u64,
            kind: self.kind,
            payload: self.payload,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            timestamp: self.created_at,
        }
    }
}
