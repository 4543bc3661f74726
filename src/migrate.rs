use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::EntityKind;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // posts, projects and tags share one shape
    for kind in EntityKind::ALL {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                banner_path TEXT NOT NULL DEFAULT '',
                icon TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                tag_slugs TEXT NOT NULL DEFAULT '[]',
                post_slugs TEXT NOT NULL DEFAULT '[]',
                project_slugs TEXT NOT NULL DEFAULT '[]',
                hashed TEXT NOT NULL DEFAULT '',
                x REAL NOT NULL DEFAULT 0,
                y REAL NOT NULL DEFAULT 0,
                z REAL NOT NULL DEFAULT 0
            )
            "#,
            table = kind.table()
        ))
        .execute(pool)
        .await?;
    }

    // Join tables: composite primary key makes INSERT OR IGNORE idempotent
    let joins = [
        ("post_to_tags", "post_id", "posts", "tag_id", "tags"),
        ("post_to_posts", "source_post_id", "posts", "target_post_id", "posts"),
        ("post_to_projects", "post_id", "posts", "project_id", "projects"),
        ("project_to_tags", "project_id", "projects", "tag_id", "tags"),
        (
            "project_to_projects",
            "source_project_id",
            "projects",
            "target_project_id",
            "projects",
        ),
        ("tag_to_tags", "source_tag_id", "tags", "target_tag_id", "tags"),
    ];
    for (table, left, left_ref, right, right_ref) in joins {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                {left} INTEGER NOT NULL REFERENCES {left_ref}(id),
                {right} INTEGER NOT NULL REFERENCES {right_ref}(id),
                PRIMARY KEY ({left}, {right})
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    // Fingerprint cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache (
            path TEXT PRIMARY KEY,
            hashed TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
