//! SQLite database layer (embedded, no external dependencies)
//!
//! One pool backs both durable collaborators: the `survey_responses` source
//! of truth and the `sync_queue` table. Timestamps are stored as integer
//! microseconds so ordering in SQL matches ordering in Rust.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tally_core::ports::{Clock, RelationalStore, SyncQueue};
use tally_core::{
    QueueStats, Result, SurveyResponse, SyncOperation, SyncQueueItem, SyncStatus, TallyError,
    LEASE_EXPIRED_ERROR, PROCESSING_LEASE_SECS,
};

pub struct Database {
    pool: Arc<SqlitePool>,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub async fn new(database_path: &str, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        tracing::info!("Opening SQLite database at: {}", database_path);

        if let Some(parent) = std::path::Path::new(database_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("Failed to connect to SQLite database at: {}", database_path)
            })?;

        Self::from_pool(pool, clock).await
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory(clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory SQLite URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::from_pool(pool, clock).await
    }

    async fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        tracing::info!("SQLite connection established, running migrations...");

        Self::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        tracing::info!("Database initialization complete");

        Ok(Self {
            pool: Arc::new(pool),
            clock,
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS survey_responses (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                survey_id TEXT NOT NULL,
                score INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'received',
                comment TEXT,
                custom_fields TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_survey_responses_client
            ON survey_responses (client_id, created_at DESC, id)
            "#,
        )
        .execute(pool)
        .await?;

        // seq keeps FIFO order independent of clock resolution
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                key TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                processed_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue (status, seq)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn now_micros(&self) -> i64 {
        self.clock.now().timestamp_micros()
    }

    async fn set_queue_status(
        &self,
        id: &str,
        query: &'static str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = self.now_micros();
        let mut statement = sqlx::query(query).bind(now);
        if let Some(error) = error {
            statement = statement.bind(error);
        }
        let result = statement
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(TallyError::NotFound(format!("sync item {}", id)));
        }
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> TallyError {
    TallyError::Database(e.to_string())
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| TallyError::Database(format!("timestamp out of range: {}", micros)))
}

#[async_trait]
impl RelationalStore for Database {
    async fn get_by_id(&self, id: &str) -> Result<Option<SurveyResponse>> {
        let row: Option<ResponseRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, survey_id, score, status, comment,
                   custom_fields, created_at, updated_at
            FROM survey_responses WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_error)?;

        row.map(SurveyResponse::try_from).transpose()
    }

    async fn get_by_client_id(
        &self,
        client_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<SurveyResponse>> {
        let rows: Vec<ResponseRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, survey_id, score, status, comment,
                   custom_fields, created_at, updated_at
            FROM survey_responses WHERE client_id = ?1
            ORDER BY created_at DESC, id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(client_id)
        .bind(take as i64)
        .bind(skip as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(SurveyResponse::try_from).collect()
    }

    async fn create(&self, response: &SurveyResponse) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO survey_responses
                (id, client_id, survey_id, score, status, comment, custom_fields, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&response.id)
        .bind(&response.client_id)
        .bind(&response.survey_id)
        .bind(response.score as i64)
        .bind(response.status.to_string())
        .bind(&response.comment)
        .bind(serde_json::to_string(&response.custom_fields)?)
        .bind(response.created_at.timestamp_micros())
        .bind(response.updated_at.timestamp_micros())
        .execute(&*self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn update(&self, response: &SurveyResponse) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE survey_responses
            SET client_id = ?1, survey_id = ?2, score = ?3, status = ?4,
                comment = ?5, custom_fields = ?6, updated_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(&response.client_id)
        .bind(&response.survey_id)
        .bind(response.score as i64)
        .bind(response.status.to_string())
        .bind(&response.comment)
        .bind(serde_json::to_string(&response.custom_fields)?)
        .bind(response.updated_at.timestamp_micros())
        .bind(&response.id)
        .execute(&*self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(TallyError::NotFound(format!("response {}", response.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM survey_responses WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_client_id(&self, client_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM survey_responses WHERE client_id = ?1")
                .bind(client_id)
                .fetch_one(&*self.pool)
                .await
                .map_err(db_error)?;

        Ok(count as u64)
    }

    async fn average_score(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let average: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(score) FROM survey_responses
            WHERE client_id = ?1 AND created_at >= ?2 AND created_at < ?3
            "#,
        )
        .bind(client_id)
        .bind(from.timestamp_micros())
        .bind(to.timestamp_micros())
        .fetch_one(&*self.pool)
        .await
        .map_err(db_error)?;

        Ok(average)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl SyncQueue for Database {
    async fn enqueue(&self, item: SyncQueueItem) -> Result<String> {
        let payload = item
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue
                (id, key, partition_key, operation, payload, status, retry_count,
                 max_retries, last_error, created_at, updated_at, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&item.id)
        .bind(&item.key)
        .bind(&item.partition_key)
        .bind(item.operation.to_string())
        .bind(payload)
        .bind(item.status.to_string())
        .bind(item.retry_count as i64)
        .bind(item.max_retries as i64)
        .bind(&item.last_error)
        .bind(item.created_at.timestamp_micros())
        .bind(item.updated_at.timestamp_micros())
        .bind(item.processed_at.map(|at| at.timestamp_micros()))
        .execute(&*self.pool)
        .await
        .map_err(db_error)?;

        Ok(item.id)
    }

    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let now = self.now_micros();
        let lease_cutoff = now - PROCESSING_LEASE_SECS * 1_000_000;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Claims older than the lease were abandoned by a worker that died
        let reclaimed = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'failed', retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
            WHERE status = 'processing' AND updated_at <= ?3
            "#,
        )
        .bind(LEASE_EXPIRED_ERROR)
        .bind(now)
        .bind(lease_cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();
        if reclaimed > 0 {
            tracing::warn!("Reclaimed {} abandoned sync items", reclaimed);
        }

        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, key, partition_key, operation, payload, status, retry_count,
                   max_retries, last_error, created_at, updated_at, processed_at
            FROM sync_queue
            WHERE status = 'pending' OR (status = 'failed' AND retry_count < max_retries)
            ORDER BY seq ASC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let mut item = SyncQueueItem::try_from(row)?;
            // failed -> pending: the retry is re-armed here
            if item.status == SyncStatus::Failed {
                sqlx::query("UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE id = ?2")
                    .bind(now)
                    .bind(&item.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
                item.status = SyncStatus::Pending;
                item.updated_at = from_micros(now)?;
            }
            batch.push(item);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(batch)
    }

    async fn mark_processing(&self, id: &str) -> Result<()> {
        self.set_queue_status(
            id,
            "UPDATE sync_queue SET status = 'processing', updated_at = ?1 WHERE id = ?2",
            None,
        )
        .await
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        self.set_queue_status(
            id,
            r#"
            UPDATE sync_queue
            SET status = 'completed', updated_at = ?1, processed_at = ?1, last_error = NULL
            WHERE id = ?2
            "#,
            None,
        )
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.set_queue_status(
            id,
            r#"
            UPDATE sync_queue
            SET status = 'failed', updated_at = ?1, last_error = ?2, retry_count = retry_count + 1
            WHERE id = ?3
            "#,
            Some(error),
        )
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, key, partition_key, operation, payload, status, retry_count,
                   max_retries, last_error, created_at, updated_at, processed_at
            FROM sync_queue WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_error)?;

        row.map(SyncQueueItem::try_from).transpose()
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'")
            .fetch_one(&*self.pool)
            .await
            .map_err(db_error)?;

        Ok(count as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, retry_count >= max_retries AS exhausted, COUNT(*)
            FROM sync_queue
            GROUP BY status, exhausted
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(db_error)?;

        let mut stats = QueueStats::default();
        for (status, exhausted, count) in rows {
            let count = count as u64;
            match SyncStatus::from_str(&status).map_err(TallyError::Database)? {
                SyncStatus::Pending => stats.pending += count,
                SyncStatus::Processing => stats.processing += count,
                SyncStatus::Completed => stats.completed += count,
                SyncStatus::Failed if exhausted != 0 => stats.dead_lettered += count,
                SyncStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }
}

// Helper structs for sqlx query_as
#[derive(sqlx::FromRow)]
struct ResponseRow {
    id: String,
    client_id: String,
    survey_id: String,
    score: i64,
    status: String,
    comment: Option<String>,
    custom_fields: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ResponseRow> for SurveyResponse {
    type Error = TallyError;

    fn try_from(r: ResponseRow) -> Result<Self> {
        Ok(SurveyResponse {
            score: u8::try_from(r.score)
                .map_err(|_| TallyError::Database(format!("bad score {} for {}", r.score, r.id)))?,
            status: r
                .status
                .parse()
                .map_err(|e| TallyError::Database(format!("row {}: {}", r.id, e)))?,
            custom_fields: serde_json::from_str(&r.custom_fields)?,
            created_at: from_micros(r.created_at)?,
            updated_at: from_micros(r.updated_at)?,
            id: r.id,
            client_id: r.client_id,
            survey_id: r.survey_id,
            comment: r.comment,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    key: String,
    partition_key: String,
    operation: String,
    payload: Option<String>,
    status: String,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    processed_at: Option<i64>,
}

impl TryFrom<QueueRow> for SyncQueueItem {
    type Error = TallyError;

    fn try_from(r: QueueRow) -> Result<Self> {
        Ok(SyncQueueItem {
            operation: SyncOperation::from_str(&r.operation).map_err(TallyError::Database)?,
            status: SyncStatus::from_str(&r.status).map_err(TallyError::Database)?,
            payload: r.payload.as_deref().map(serde_json::from_str).transpose()?,
            retry_count: r.retry_count.max(0) as u32,
            max_retries: r.max_retries.max(0) as u32,
            created_at: from_micros(r.created_at)?,
            updated_at: from_micros(r.updated_at)?,
            processed_at: r.processed_at.map(from_micros).transpose()?,
            id: r.id,
            key: r.key,
            partition_key: r.partition_key,
            last_error: r.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tally_core::ports::ManualClock;
    use tally_core::{CustomFields, FieldValue, ResponseStatus};

    fn response(id: &str, client: &str, score: u8, created_at: DateTime<Utc>) -> SurveyResponse {
        let mut custom_fields = CustomFields::new();
        custom_fields.insert("channel".to_string(), FieldValue::from("email"));
        SurveyResponse {
            id: id.to_string(),
            client_id: client.to_string(),
            survey_id: "q3-nps".to_string(),
            score,
            status: ResponseStatus::Received,
            comment: None,
            custom_fields,
            created_at,
            updated_at: created_at,
        }
    }

    // Whole seconds, so values survive the microsecond columns unchanged
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    async fn database() -> (Arc<ManualClock>, Database) {
        let clock = Arc::new(ManualClock::new(start()));
        let db = Database::in_memory(clock.clone()).await.unwrap();
        (clock, db)
    }

    #[tokio::test]
    async fn test_response_crud() {
        let (clock, db) = database().await;
        let now = clock.now();

        let mut r = response("r1", "acme", 9, now);
        db.create(&r).await.unwrap();
        assert!(db.create(&r).await.is_err());

        let stored = db.get_by_id("r1").await.unwrap().unwrap();
        assert_eq!(stored, r);

        r.status = ResponseStatus::Flagged;
        r.updated_at = now + Duration::seconds(1);
        db.update(&r).await.unwrap();
        assert_eq!(
            db.get_by_id("r1").await.unwrap().unwrap().status,
            ResponseStatus::Flagged
        );

        let missing = response("nope", "acme", 1, now);
        assert!(matches!(
            db.update(&missing).await,
            Err(TallyError::NotFound(_))
        ));

        assert!(db.delete("r1").await.unwrap());
        assert!(!db.delete("r1").await.unwrap());
        assert!(db.get_by_id("r1").await.unwrap().is_none());
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_and_aggregates() {
        let (clock, db) = database().await;
        let t0 = clock.now();

        db.create(&response("a", "acme", 10, t0)).await.unwrap();
        db.create(&response("b", "acme", 6, t0 + Duration::seconds(1)))
            .await
            .unwrap();
        db.create(&response("c", "acme", 8, t0 + Duration::seconds(1)))
            .await
            .unwrap();
        db.create(&response("z", "globex", 0, t0)).await.unwrap();

        let ids: Vec<String> = db
            .get_by_client_id("acme", 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let page = db.get_by_client_id("acme", 1, 1).await.unwrap();
        assert_eq!(page[0].id, "c");

        assert_eq!(db.count_by_client_id("acme").await.unwrap(), 3);

        let avg = db
            .average_score("acme", t0, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(avg, Some(10.0));
        let avg = db
            .average_score("acme", t0, t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(avg, Some(8.0));
        assert_eq!(
            db.average_score("nobody", t0, t0 + Duration::days(1))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_queue_retry_budget() {
        let (clock, db) = database().await;
        let item = SyncQueueItem::new(
            "q1".to_string(),
            SyncOperation::Create,
            "r1".to_string(),
            "acme".to_string(),
            Some(response("r1", "acme", 7, clock.now())),
            clock.now(),
        );
        assert_eq!(db.enqueue(item.clone()).await.unwrap(), "q1");
        assert_eq!(db.len().await.unwrap(), 1);

        for attempt in 1..=3 {
            let batch = db.dequeue_batch(10).await.unwrap();
            assert_eq!(batch.len(), 1, "attempt {}", attempt);
            assert_eq!(batch[0].payload, item.payload);
            db.mark_processing("q1").await.unwrap();
            db.mark_failed("q1", "boom").await.unwrap();
        }

        assert!(db.dequeue_batch(10).await.unwrap().is_empty());
        let stored = db.get("q1").await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.failed, 0);

        assert!(matches!(
            db.mark_processed("missing").await,
            Err(TallyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_order_and_completion() {
        let (clock, db) = database().await;
        for id in ["q1", "q2", "q3"] {
            let item = SyncQueueItem::new(
                id.to_string(),
                SyncOperation::Delete,
                "r1".to_string(),
                "acme".to_string(),
                None,
                clock.now(),
            );
            db.enqueue(item).await.unwrap();
        }

        let batch = db.dequeue_batch(2).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2"]);

        clock.advance(Duration::seconds(1));
        db.mark_processing("q1").await.unwrap();
        db.mark_processed("q1").await.unwrap();

        let done = db.get("q1").await.unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.processed_at, Some(clock.now()));

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn test_queue_reclaims_abandoned_claim() {
        let (clock, db) = database().await;
        let item = SyncQueueItem::new(
            "q1".to_string(),
            SyncOperation::Delete,
            "r1".to_string(),
            "acme".to_string(),
            None,
            clock.now(),
        );
        db.enqueue(item).await.unwrap();
        db.dequeue_batch(10).await.unwrap();
        db.mark_processing("q1").await.unwrap();

        clock.advance(Duration::seconds(PROCESSING_LEASE_SECS - 1));
        assert!(db.dequeue_batch(10).await.unwrap().is_empty());
        assert_eq!(db.stats().await.unwrap().processing, 1);

        clock.advance(Duration::seconds(1));
        let batch = db.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, SyncStatus::Pending);
        assert_eq!(batch[0].retry_count, 1);
        assert_eq!(batch[0].last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("tally.db");
        let path = path.to_str().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());

        {
            let db = Database::new(path, clock.clone()).await.unwrap();
            db.create(&response("r1", "acme", 9, clock.now()))
                .await
                .unwrap();
        }

        let db = Database::new(path, clock).await.unwrap();
        assert!(db.get_by_id("r1").await.unwrap().is_some());
    }
}
