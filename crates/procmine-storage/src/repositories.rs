// Repository layer for database operations
//
// One durable SQLite file per device. sqlx serialises writers; readers see
// snapshot-consistent state through WAL. Constraint violations surface as
// typed engine errors so callers can decide (the extractor merges, the API
// returns 409).

use anyhow::Context;
use chrono::{DateTime, Utc};
use procmine_core::error::{EngineError, Result};
use procmine_core::event::EventRef;
use procmine_core::objects::LinkProvenance;
use procmine_core::rules::ExtractionRule;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> EngineError {
    EngineError::Internal(anyhow::Error::new(e).context("database operation failed"))
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the store file and apply pending
    /// migrations forward in order.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("opening store file")?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply embedded migrations; a failure here is fatal (exit code 3)
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running store migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============================================
    // Events
    // ============================================

    /// Append watcher events; existing (bucket, id) rows are left untouched
    pub async fn insert_events(&self, bucket_id: &str, events: &[NewEvent]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0u64;
        for event in events {
            let data = event.data.to_string();
            let done = sqlx::query(
                r#"
                INSERT OR IGNORE INTO events (bucket_id, id, timestamp, duration, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(bucket_id)
            .bind(event.id)
            .bind(event.timestamp)
            .bind(event.duration)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += done.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    /// Events in a time range, timestamp ascending with a stable tie-break
    /// on (bucket, id)
    pub async fn read_events(
        &self,
        bucket_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRow>> {
        let rows = match bucket_id {
            Some(bucket) => {
                sqlx::query_as::<_, EventRow>(
                    r#"
                    SELECT bucket_id, id, timestamp, duration, data
                    FROM events
                    WHERE bucket_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                    ORDER BY timestamp ASC, bucket_id ASC, id ASC
                    "#,
                )
                .bind(bucket)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EventRow>(
                    r#"
                    SELECT bucket_id, id, timestamp, duration, data
                    FROM events
                    WHERE timestamp >= ?1 AND timestamp < ?2
                    ORDER BY timestamp ASC, bucket_id ASC, id ASC
                    "#,
                )
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        Ok(rows)
    }

    pub async fn count_events(
        &self,
        bucket_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        let count: (i64,) = match bucket_id {
            Some(bucket) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM events WHERE bucket_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                )
                .bind(bucket)
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM events WHERE timestamp >= ?1 AND timestamp < ?2")
                    .bind(start)
                    .bind(end)
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        Ok(count.0)
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketSummary>> {
        sqlx::query_as::<_, BucketSummary>(
            r#"
            SELECT bucket_id, COUNT(*) AS event_count, MAX(timestamp) AS last_timestamp
            FROM events
            GROUP BY bucket_id
            ORDER BY bucket_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn get_event(&self, bucket_id: &str, event_id: i64) -> Result<Option<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT bucket_id, id, timestamp, duration, data FROM events WHERE bucket_id = ?1 AND id = ?2",
        )
        .bind(bucket_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    // ============================================
    // Object types
    // ============================================

    pub async fn create_object_type(&self, input: CreateObjectType) -> Result<ObjectTypeRow> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let schema = input.schema.map(|s| s.to_string());
        sqlx::query(
            r#"
            INSERT INTO object_types (id, name, display_name, schema, icon, color, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.display_name)
        .bind(&schema)
        .bind(&input.icon)
        .bind(&input.color)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.is_unique_violation() => {
                EngineError::conflict(format!("object type '{}' already exists", input.name))
            }
            other => db_err(other),
        })?;
        self.get_object_type(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("object_type", id))
    }

    pub async fn get_object_type(&self, id: &str) -> Result<Option<ObjectTypeRow>> {
        sqlx::query_as::<_, ObjectTypeRow>(
            "SELECT id, name, display_name, schema, icon, color, created_at, updated_at FROM object_types WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn get_object_type_by_name(&self, name: &str) -> Result<Option<ObjectTypeRow>> {
        sqlx::query_as::<_, ObjectTypeRow>(
            "SELECT id, name, display_name, schema, icon, color, created_at, updated_at FROM object_types WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list_object_types(&self) -> Result<Vec<ObjectTypeRow>> {
        sqlx::query_as::<_, ObjectTypeRow>(
            "SELECT id, name, display_name, schema, icon, color, created_at, updated_at FROM object_types ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn update_object_type(&self, id: &str, input: UpdateObjectType) -> Result<Option<ObjectTypeRow>> {
        let schema = input.schema.map(|s| s.to_string());
        sqlx::query(
            r#"
            UPDATE object_types
            SET display_name = COALESCE(?2, display_name),
                schema = COALESCE(?3, schema),
                icon = COALESCE(?4, icon),
                color = COALESCE(?5, color),
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&input.display_name)
        .bind(&schema)
        .bind(&input.icon)
        .bind(&input.color)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.get_object_type(id).await
    }

    /// Deleting a type is forbidden while any object of that type exists
    pub async fn delete_object_type(&self, id: &str) -> Result<bool> {
        let Some(row) = self.get_object_type(id).await? else {
            return Ok(false);
        };
        let in_use: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects WHERE object_type = ?1")
            .bind(&row.name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        if in_use.0 > 0 {
            return Err(EngineError::precondition(format!(
                "object type '{}' still has {} objects",
                row.name, in_use.0
            )));
        }
        let done = sqlx::query("DELETE FROM object_types WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    // ============================================
    // Objects
    // ============================================

    /// Create or merge an object, enforcing (type, name) uniqueness.
    ///
    /// On merge, existing data keys win unless `replace` is set; genuinely
    /// new keys are always added. Returns the row and whether it was
    /// created.
    pub async fn upsert_object(
        &self,
        object_type: &str,
        name: &str,
        data: serde_json::Value,
        replace: bool,
    ) -> Result<(ObjectRow, bool)> {
        if self.get_object_type_by_name(object_type).await?.is_none() {
            return Err(EngineError::not_found("object_type", object_type));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query_as::<_, ObjectRow>(
            "SELECT id, object_type, name, data, created_at, updated_at FROM objects WHERE object_type = ?1 AND name = ?2",
        )
        .bind(object_type)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let (id, created) = match existing {
            Some(row) => {
                let mut merged: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(&row.data).unwrap_or_default();
                if let serde_json::Value::Object(incoming) = data {
                    for (key, value) in incoming {
                        if replace || !merged.contains_key(&key) {
                            merged.insert(key, value);
                        }
                    }
                }
                sqlx::query("UPDATE objects SET data = ?2, updated_at = ?3 WHERE id = ?1")
                    .bind(&row.id)
                    .bind(serde_json::Value::Object(merged).to_string())
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                (row.id, false)
            }
            None => {
                let id = Uuid::now_v7().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO objects (id, object_type, name, data, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    "#,
                )
                .bind(&id)
                .bind(object_type)
                .bind(name)
                .bind(data.to_string())
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                (id, true)
            }
        };
        tx.commit().await.map_err(db_err)?;
        let refreshed = self
            .get_object(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("object", id))?;
        Ok((refreshed, created))
    }

    pub async fn get_object(&self, id: &str) -> Result<Option<ObjectRow>> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT id, object_type, name, data, created_at, updated_at FROM objects WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list_objects(
        &self,
        object_type: Option<&str>,
        query: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ObjectRow>> {
        let pattern = query.map(|q| format!("%{}%", q.trim().to_lowercase()));
        sqlx::query_as::<_, ObjectRow>(
            r#"
            SELECT id, object_type, name, data, created_at, updated_at
            FROM objects
            WHERE (?1 IS NULL OR object_type = ?1)
              AND (?2 IS NULL OR LOWER(name) LIKE ?2)
              AND (?3 IS NULL OR updated_at >= ?3)
              AND (?4 IS NULL OR updated_at < ?4)
            ORDER BY updated_at DESC
            LIMIT ?5
            "#,
        )
        .bind(object_type)
        .bind(&pattern)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn update_object(&self, id: &str, input: UpdateObject) -> Result<Option<ObjectRow>> {
        let data = input.data.map(|d| d.to_string());
        let done = sqlx::query(
            r#"
            UPDATE objects
            SET name = COALESCE(?2, name),
                data = COALESCE(?3, data),
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.is_unique_violation() => {
                EngineError::conflict("another object of this type already has that name")
            }
            other => db_err(other),
        })?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_object(id).await
    }

    /// Delete an object; links cascade
    pub async fn delete_object(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM objects WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    // ============================================
    // Event-object links
    // ============================================

    /// Idempotent on the (bucket, event, object) triple; re-linking updates
    /// provenance and confidence so the last writer is recorded
    pub async fn link_event_to_object(
        &self,
        event: &EventRef,
        object_id: Uuid,
        provenance: &LinkProvenance,
        confidence: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_objects (bucket_id, event_id, object_id, provenance, confidence, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (bucket_id, event_id, object_id)
            DO UPDATE SET provenance = excluded.provenance, confidence = excluded.confidence
            "#,
        )
        .bind(&event.bucket_id)
        .bind(event.event_id)
        .bind(object_id.to_string())
        .bind(provenance.encode())
        .bind(confidence)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => {
                EngineError::not_found("object", object_id)
            }
            other => db_err(other),
        })?;
        Ok(())
    }

    pub async fn unlink_event_from_object(&self, event: &EventRef, object_id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "DELETE FROM event_objects WHERE bucket_id = ?1 AND event_id = ?2 AND object_id = ?3",
        )
        .bind(&event.bucket_id)
        .bind(event.event_id)
        .bind(object_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn links_for_event(&self, event: &EventRef) -> Result<Vec<EventObjectRow>> {
        sqlx::query_as::<_, EventObjectRow>(
            r#"
            SELECT bucket_id, event_id, object_id, provenance, confidence, created_at
            FROM event_objects
            WHERE bucket_id = ?1 AND event_id = ?2
            ORDER BY object_id ASC
            "#,
        )
        .bind(&event.bucket_id)
        .bind(event.event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn objects_for_event(&self, event: &EventRef) -> Result<Vec<ObjectRow>> {
        sqlx::query_as::<_, ObjectRow>(
            r#"
            SELECT o.id, o.object_type, o.name, o.data, o.created_at, o.updated_at
            FROM objects o
            JOIN event_objects eo ON eo.object_id = o.id
            WHERE eo.bucket_id = ?1 AND eo.event_id = ?2
            ORDER BY o.object_type ASC, o.name ASC
            "#,
        )
        .bind(&event.bucket_id)
        .bind(event.event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn events_for_object(
        &self,
        object_id: Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.bucket_id, e.id, e.timestamp, e.duration, e.data
            FROM events e
            JOIN event_objects eo ON eo.bucket_id = e.bucket_id AND eo.event_id = e.id
            WHERE eo.object_id = ?1
              AND (?2 IS NULL OR e.timestamp >= ?2)
              AND (?3 IS NULL OR e.timestamp < ?3)
            ORDER BY e.timestamp ASC, e.bucket_id ASC, e.id ASC
            "#,
        )
        .bind(object_id.to_string())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Links for a batch of events, for case building
    pub async fn links_for_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventObjectRow>> {
        sqlx::query_as::<_, EventObjectRow>(
            r#"
            SELECT eo.bucket_id, eo.event_id, eo.object_id, eo.provenance, eo.confidence, eo.created_at
            FROM event_objects eo
            JOIN events e ON e.bucket_id = eo.bucket_id AND e.id = eo.event_id
            WHERE e.timestamp >= ?1 AND e.timestamp < ?2
            ORDER BY eo.bucket_id ASC, eo.event_id ASC, eo.object_id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    // ============================================
    // Extraction rules
    // ============================================

    pub async fn create_rule(&self, rule: &ExtractionRule) -> Result<ExtractionRuleRow> {
        if self.get_object_type_by_name(&rule.object_type).await?.is_none() {
            return Err(EngineError::not_found("object_type", &rule.object_type));
        }
        sqlx::query(
            r#"
            INSERT INTO extraction_rules
                (id, name, object_type, source_fields, pattern, name_template, data_mapping,
                 enabled, priority, provenance, match_count, confirm_count, reject_count,
                 confidence, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.name)
        .bind(&rule.object_type)
        .bind(serde_json::to_string(&rule.source_fields).unwrap_or_else(|_| "[]".into()))
        .bind(&rule.pattern)
        .bind(&rule.name_template)
        .bind(serde_json::to_string(&rule.data_mapping).unwrap_or_else(|_| "{}".into()))
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(rule.provenance.as_str())
        .bind(rule.match_count)
        .bind(rule.confirm_count)
        .bind(rule.reject_count)
        .bind(rule.confidence)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.get_rule(&rule.id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found("extraction_rule", rule.id))
    }

    pub async fn get_rule(&self, id: &str) -> Result<Option<ExtractionRuleRow>> {
        sqlx::query_as::<_, ExtractionRuleRow>("SELECT * FROM extraction_rules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<ExtractionRuleRow>> {
        let sql = if enabled_only {
            "SELECT * FROM extraction_rules WHERE enabled = 1 ORDER BY priority DESC, id ASC"
        } else {
            "SELECT * FROM extraction_rules ORDER BY priority DESC, id ASC"
        };
        sqlx::query_as::<_, ExtractionRuleRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn update_rule(&self, id: &str, input: UpdateRule) -> Result<Option<ExtractionRuleRow>> {
        let source_fields = input
            .source_fields
            .map(|f| serde_json::to_string(&f).unwrap_or_else(|_| "[]".into()));
        let data_mapping = input
            .data_mapping
            .map(|m| serde_json::to_string(&m).unwrap_or_else(|_| "{}".into()));
        let done = sqlx::query(
            r#"
            UPDATE extraction_rules
            SET name = COALESCE(?2, name),
                source_fields = COALESCE(?3, source_fields),
                pattern = COALESCE(?4, pattern),
                name_template = COALESCE(?5, name_template),
                data_mapping = COALESCE(?6, data_mapping),
                enabled = COALESCE(?7, enabled),
                priority = COALESCE(?8, priority),
                updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&source_fields)
        .bind(&input.pattern)
        .bind(&input.name_template)
        .bind(&data_mapping)
        .bind(input.enabled)
        .bind(input.priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_rule(id).await
    }

    pub async fn delete_rule(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM extraction_rules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn bump_rule_match_count(&self, id: Uuid, delta: i64) -> Result<()> {
        sqlx::query("UPDATE extraction_rules SET match_count = match_count + ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(delta)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Apply confirm/reject feedback counters and the new confidence;
    /// optionally disables the rule (demotion)
    pub async fn apply_rule_feedback(
        &self,
        id: Uuid,
        confirm_delta: i64,
        reject_delta: i64,
        confidence: f64,
        disable: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE extraction_rules
            SET confirm_count = confirm_count + ?2,
                reject_count = reject_count + ?3,
                confidence = ?4,
                enabled = CASE WHEN ?5 THEN 0 ELSE enabled END,
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(confirm_delta)
        .bind(reject_delta)
        .bind(confidence)
        .bind(disable)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn quarantine_rule(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE extraction_rules SET enabled = 0, updated_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ============================================
    // Steps
    // ============================================

    pub async fn create_step(&self, input: CreateStep) -> Result<StepRow> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let data = input.data.map(|d| d.to_string());
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO steps (id, name, start_time, end_time, duration, data, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(input.start_time)
        .bind(input.end_time)
        .bind(input.duration)
        .bind(&data)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        for (position, event) in input.event_refs.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO step_events (step_id, bucket_id, event_id, position) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&id)
            .bind(&event.bucket_id)
            .bind(event.event_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for object_id in &input.object_ids {
            sqlx::query("INSERT OR IGNORE INTO step_objects (step_id, object_id) VALUES (?1, ?2)")
                .bind(&id)
                .bind(object_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        self.get_step(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("step", id))
    }

    pub async fn get_step(&self, id: &str) -> Result<Option<StepRow>> {
        sqlx::query_as::<_, StepRow>("SELECT * FROM steps WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn list_steps(&self, limit: i64) -> Result<Vec<StepRow>> {
        sqlx::query_as::<_, StepRow>("SELECT * FROM steps ORDER BY start_time DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn update_step(&self, id: &str, input: UpdateStep) -> Result<Option<StepRow>> {
        let data = input.data.map(|d| d.to_string());
        let done = sqlx::query(
            r#"
            UPDATE steps
            SET name = COALESCE(?2, name),
                data = COALESCE(?3, data),
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_step(id).await
    }

    pub async fn delete_step(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM steps WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn step_event_refs(&self, step_id: &str) -> Result<Vec<EventRef>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT bucket_id, event_id FROM step_events WHERE step_id = ?1 ORDER BY position ASC",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(bucket_id, event_id)| EventRef {
                bucket_id,
                event_id,
            })
            .collect())
    }

    pub async fn step_object_ids(&self, step_id: &str) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT object_id FROM step_objects WHERE step_id = ?1 ORDER BY object_id ASC")
                .bind(step_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }

    pub async fn add_step_object(&self, step_id: &str, object_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO step_objects (step_id, object_id) VALUES (?1, ?2)")
            .bind(step_id)
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => {
                    EngineError::not_found("object", object_id)
                }
                other => db_err(other),
            })?;
        Ok(())
    }

    pub async fn remove_step_object(&self, step_id: &str, object_id: Uuid) -> Result<bool> {
        let done = sqlx::query("DELETE FROM step_objects WHERE step_id = ?1 AND object_id = ?2")
            .bind(step_id)
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    // ============================================
    // Workflows
    // ============================================

    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let pattern = serde_json::to_string(&input.pattern)
            .map_err(|e| EngineError::invalid(format!("unserialisable pattern: {e}")))?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description, pattern, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&pattern)
        .bind(input.state.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        for (position, step_id) in input.step_ids.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO workflow_steps (workflow_id, step_id, position) VALUES (?1, ?2, ?3)",
            )
            .bind(&id)
            .bind(step_id.to_string())
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for object_id in &input.object_ids {
            sqlx::query("INSERT OR IGNORE INTO workflow_objects (workflow_id, object_id) VALUES (?1, ?2)")
                .bind(&id)
                .bind(object_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        self.get_workflow(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRow>> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Default listing excludes archived (and always excludes deleted-in-
    /// flight rows, which are removed immediately anyway)
    pub async fn list_workflows(&self, include_archived: bool) -> Result<Vec<WorkflowRow>> {
        let sql = if include_archived {
            "SELECT * FROM workflows ORDER BY created_at DESC"
        } else {
            "SELECT * FROM workflows WHERE state != 'archived' ORDER BY created_at DESC"
        };
        sqlx::query_as::<_, WorkflowRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn update_workflow(&self, id: &str, input: UpdateWorkflow) -> Result<Option<WorkflowRow>> {
        let pattern = input
            .pattern
            .map(|p| serde_json::to_string(&p))
            .transpose()
            .map_err(|e| EngineError::invalid(format!("unserialisable pattern: {e}")))?;
        let done = sqlx::query(
            r#"
            UPDATE workflows
            SET name = COALESCE(?2, name),
                description = COALESCE(?3, description),
                pattern = COALESCE(?4, pattern),
                state = COALESCE(?5, state),
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&pattern)
        .bind(input.state.map(|s| s.as_str()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_workflow(id).await
    }

    /// Delete a workflow; occurrences and their step instances cascade
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM workflows WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn workflow_step_ids(&self, workflow_id: &str) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT step_id FROM workflow_steps WHERE workflow_id = ?1 ORDER BY position ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }

    pub async fn workflow_object_ids(&self, workflow_id: &str) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT object_id FROM workflow_objects WHERE workflow_id = ?1 ORDER BY object_id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }

    pub async fn add_workflow_object(&self, workflow_id: &str, object_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO workflow_objects (workflow_id, object_id) VALUES (?1, ?2)")
            .bind(workflow_id)
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => {
                    EngineError::not_found("object", object_id)
                }
                other => db_err(other),
            })?;
        Ok(())
    }

    pub async fn remove_workflow_object(&self, workflow_id: &str, object_id: Uuid) -> Result<bool> {
        let done = sqlx::query("DELETE FROM workflow_objects WHERE workflow_id = ?1 AND object_id = ?2")
            .bind(workflow_id)
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }

    // ============================================
    // Occurrences
    // ============================================

    pub async fn create_occurrence(&self, input: CreateOccurrence) -> Result<OccurrenceRow> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO occurrences (id, workflow_id, start_time, end_time, duration, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&id)
        .bind(input.workflow_id.to_string())
        .bind(input.start_time)
        .bind(input.end_time)
        .bind(input.duration)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => {
                EngineError::not_found("workflow", input.workflow_id)
            }
            other => db_err(other),
        })?;
        for (step_id, position) in &input.steps {
            sqlx::query(
                "INSERT INTO occurrence_step_instances (occurrence_id, step_id, position) VALUES (?1, ?2, ?3)",
            )
            .bind(&id)
            .bind(step_id.to_string())
            .bind(*position as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        self.get_occurrence(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("occurrence", id))
    }

    pub async fn get_occurrence(&self, id: &str) -> Result<Option<OccurrenceRow>> {
        sqlx::query_as::<_, OccurrenceRow>("SELECT * FROM occurrences WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn list_occurrences(&self, workflow_id: &str) -> Result<Vec<OccurrenceRow>> {
        sqlx::query_as::<_, OccurrenceRow>(
            "SELECT * FROM occurrences WHERE workflow_id = ?1 ORDER BY start_time ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn occurrence_steps(&self, occurrence_id: &str) -> Result<Vec<OccurrenceStepRow>> {
        sqlx::query_as::<_, OccurrenceStepRow>(
            "SELECT occurrence_id, step_id, position FROM occurrence_step_instances WHERE occurrence_id = ?1 ORDER BY position ASC",
        )
        .bind(occurrence_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn count_occurrences(&self, workflow_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM occurrences WHERE workflow_id = ?1")
            .bind(workflow_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count.0)
    }

    // ============================================
    // Review tasks (training queue)
    // ============================================

    pub async fn create_review_task(&self, input: CreateReviewTask) -> Result<ReviewTaskRow> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        sqlx::query(
            r#"
            INSERT INTO review_tasks
                (id, bucket_id, event_id, object_type, identifier, identifier_key, confidence, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)
            "#,
        )
        .bind(&id)
        .bind(&input.bucket_id)
        .bind(input.event_id)
        .bind(&input.object_type)
        .bind(&input.identifier)
        .bind(&input.identifier_key)
        .bind(input.confidence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.get_review_task(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("review_task", id))
    }

    pub async fn get_review_task(&self, id: &str) -> Result<Option<ReviewTaskRow>> {
        sqlx::query_as::<_, ReviewTaskRow>("SELECT * FROM review_tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn list_pending_review_tasks(&self, limit: i64) -> Result<Vec<ReviewTaskRow>> {
        sqlx::query_as::<_, ReviewTaskRow>(
            "SELECT * FROM review_tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn resolve_review_task(&self, id: &str, status: &str) -> Result<Option<ReviewTaskRow>> {
        let done = sqlx::query(
            "UPDATE review_tasks SET status = ?2, resolved_at = ?3 WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_review_task(id).await
    }

    // ============================================
    // Audit
    // ============================================

    pub async fn record_audit(&self, kind: &str, entity_id: Option<&str>, detail: serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, kind, entity_id, detail, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(kind)
        .bind(entity_id)
        .bind(detail.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_audit_events(&self, limit: i64) -> Result<Vec<AuditEventRow>> {
        sqlx::query_as::<_, AuditEventRow>(
            "SELECT * FROM audit_events ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
