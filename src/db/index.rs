//! Sorted indexes.

use crate::error::Result;
use crate::model::event::{IndexEntry, IndexRange};

impl super::Db {
    pub async fn write_index_member(&self, key: &str, member: &str, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO sorted_indexes (index_key, member, score) VALUES ($1, $2, $3)
             ON CONFLICT (index_key, member) DO UPDATE SET score = EXCLUDED.score",
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_index(&self, key: &str, range: &IndexRange) -> Result<Vec<IndexEntry>> {
        let order = if range.reverse {
            "score DESC, member DESC"
        } else {
            "score ASC, member ASC"
        };
        // LIMIT NULL means no limit in Postgres.
        let sql = format!(
            "SELECT member, score FROM sorted_indexes WHERE index_key = $1
             ORDER BY {order} OFFSET $2 LIMIT $3"
        );
        let rows: Vec<(String, f64)> = sqlx::query_as(&sql)
            .bind(key)
            .bind(range.offset as i64)
            .bind(range.limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| IndexEntry { member, score })
            .collect())
    }

    pub async fn count_index(&self, key: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sorted_indexes WHERE index_key = $1")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    pub async fn remove_index_member(&self, key: &str, member: &str) -> Result<()> {
        sqlx::query("DELETE FROM sorted_indexes WHERE index_key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn drop_index(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sorted_indexes WHERE index_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
