use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{SaveId, UnitId},
    protocol::{Document, Save, SaveSet, UnitOfWork},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_unit(&self, name: &str, template: Option<&Document>) -> Result<UnitId> {
        let rec = sqlx::query("INSERT INTO units (name, template) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(template.map(Document::as_str))
            .fetch_one(&self.pool)
            .await
            .context("failed to insert unit")?;
        Ok(UnitId(rec.get::<i64, _>(0)))
    }

    /// Replaces the template of an existing unit, or creates the unit with
    /// the given id when it does not exist yet.
    pub async fn upsert_unit(
        &self,
        unit_id: UnitId,
        name: &str,
        template: Option<&Document>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO units (id, name, template) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, template=excluded.template",
        )
        .bind(unit_id.0)
        .bind(name)
        .bind(template.map(Document::as_str))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert unit {}", unit_id.0))?;
        Ok(())
    }

    pub async fn unit(&self, unit_id: UnitId) -> Result<Option<UnitOfWork>> {
        let row = sqlx::query("SELECT id, name, template FROM units WHERE id = ?")
            .bind(unit_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UnitOfWork {
            id: UnitId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            template: r.get::<Option<String>, _>(2).map(Document::from),
        }))
    }

    pub async fn unit_exists(&self, unit_id: UnitId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM units WHERE id = ?")
            .bind(unit_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Records a new save. Saves are append-only: an older save is never
    /// rewritten, the new row supersedes it as `current`.
    pub async fn create_save(&self, unit_id: UnitId, workspace: &Document) -> Result<Save> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO saves (unit_id, workspace, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(unit_id.0)
        .bind(workspace.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert save for unit {}", unit_id.0))?;

        Ok(Save {
            id: SaveId(rec.get::<i64, _>(0)),
            unit_id,
            workspace: workspace.clone(),
            updated_at: now,
        })
    }

    pub async fn save(&self, save_id: SaveId) -> Result<Option<Save>> {
        let row = sqlx::query("SELECT id, unit_id, workspace, updated_at FROM saves WHERE id = ?")
            .bind(save_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| save_from_row(&r)).transpose()
    }

    /// Newest save becomes `current`; everything older is `past`, newest
    /// first. Ordering is by insertion id so it is stable across calls.
    pub async fn save_set(&self, unit_id: UnitId) -> Result<SaveSet> {
        let rows = sqlx::query(
            "SELECT id, unit_id, workspace, updated_at
             FROM saves
             WHERE unit_id = ?
             ORDER BY id DESC",
        )
        .bind(unit_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list saves for unit {}", unit_id.0))?;

        let mut saves = rows
            .iter()
            .map(save_from_row)
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let current = saves.next();
        Ok(SaveSet {
            current,
            past: saves.collect(),
        })
    }
}

fn save_from_row(row: &SqliteRow) -> Result<Save> {
    Ok(Save {
        id: SaveId(row.try_get::<i64, _>(0)?),
        unit_id: UnitId(row.try_get::<i64, _>(1)?),
        workspace: Document::from(row.try_get::<String, _>(2)?),
        updated_at: row.try_get::<DateTime<Utc>, _>(3)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
