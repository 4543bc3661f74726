//! SQLite-backed [`EntityStore`] implementation.
//!
//! Posts, projects and tags share one column layout (see
//! [`migrate`](crate::migrate)); slug lists are stored as JSON text and
//! timestamps as unix seconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{Association, Entity, EntityKind, FingerprintEntry, JOIN_TABLES};

use super::{EntityStore, StoreCounts};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn decode_slugs(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).with_context(|| format!("invalid slug list: {}", json))
}

fn row_to_entity(kind: EntityKind, row: &SqliteRow) -> Result<Entity> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let tag_slugs: String = row.try_get("tag_slugs")?;
    let post_slugs: String = row.try_get("post_slugs")?;
    let project_slugs: String = row.try_get("project_slugs")?;

    Ok(Entity {
        id: row.try_get("id")?,
        kind,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        content: row.try_get("content")?,
        banner_path: row.try_get("banner_path")?,
        icon: row.try_get("icon")?,
        created_at: ts_to_datetime(created_at),
        updated_at: ts_to_datetime(updated_at),
        tag_slugs: decode_slugs(&tag_slugs)?,
        post_slugs: decode_slugs(&post_slugs)?,
        project_slugs: decode_slugs(&project_slugs)?,
        fingerprint: row.try_get("hashed")?,
        x: row.try_get("x")?,
        y: row.try_get("y")?,
        z: row.try_get("z")?,
    })
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<Entity> {
        let sql = format!(
            r#"
            INSERT INTO {table} (slug, title, description, content, banner_path, icon,
                                 created_at, updated_at, tag_slugs, post_slugs,
                                 project_slugs, hashed, x, y, z)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                content = excluded.content,
                banner_path = excluded.banner_path,
                icon = excluded.icon,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                tag_slugs = excluded.tag_slugs,
                post_slugs = excluded.post_slugs,
                project_slugs = excluded.project_slugs,
                hashed = excluded.hashed,
                x = excluded.x,
                y = excluded.y,
                z = excluded.z
            RETURNING id
            "#,
            table = entity.kind.table()
        );

        let id: i64 = sqlx::query_scalar(&sql)
            .bind(&entity.slug)
            .bind(&entity.title)
            .bind(&entity.description)
            .bind(&entity.content)
            .bind(&entity.banner_path)
            .bind(&entity.icon)
            .bind(entity.created_at.timestamp())
            .bind(entity.updated_at.timestamp())
            .bind(serde_json::to_string(&entity.tag_slugs)?)
            .bind(serde_json::to_string(&entity.post_slugs)?)
            .bind(serde_json::to_string(&entity.project_slugs)?)
            .bind(&entity.fingerprint)
            .bind(entity.x)
            .bind(entity.y)
            .bind(entity.z)
            .fetch_one(&self.pool)
            .await?;

        let mut saved = entity.clone();
        saved.id = id;
        Ok(saved)
    }

    async fn find_by_slug(&self, kind: EntityKind, slug: &str) -> Result<Option<Entity>> {
        let sql = format!("SELECT * FROM {} WHERE slug = ?", kind.table());
        let row = sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_entity(kind, &r)).transpose()
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintEntry>> {
        let rows = sqlx::query("SELECT path, hashed FROM cache")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| FingerprintEntry {
                path: row.get("path"),
                fingerprint: row.get("hashed"),
            })
            .collect())
    }

    async fn upsert_fingerprints(&self, entries: &[FingerprintEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO cache (path, hashed, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    hashed = excluded.hashed,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&e.path)
            .bind(&e.fingerprint)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_fingerprints(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_association(&self, association: &Association) -> Result<bool> {
        let (join, left, right) = association.join();
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?, ?)",
            join.table, join.left_column, join.right_column
        );
        let result = sqlx::query(&sql)
            .bind(left)
            .bind(right)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let count = |table: &str| {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            let pool = self.pool.clone();
            async move {
                let n: i64 = sqlx::query_scalar(&sql).fetch_one(&pool).await?;
                Ok::<u64, anyhow::Error>(n as u64)
            }
        };

        let mut associations = 0;
        for table in JOIN_TABLES {
            associations += count(table).await?;
        }

        Ok(StoreCounts {
            posts: count("posts").await?,
            projects: count("projects").await?,
            tags: count("tags").await?,
            associations,
            fingerprints: count("cache").await?,
        })
    }
}
