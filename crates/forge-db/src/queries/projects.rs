//! Query functions for the `projects` table.

use anyhow::{Context, Result};
use uuid::Uuid;
use sqlx::PgPool;

use crate::models::Project;

/// Register a new project. Projects are created once and are immutable
/// except for their descriptive fields.
pub async fn insert_project(
    pool: &PgPool,
    name: &str,
    repo_path: &str,
    default_branch: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (name, repo_path, default_branch) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(name)
    .bind(repo_path)
    .bind(default_branch)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all registered projects, most recently created first.
pub async fn list_projects(pool: &PgPool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list projects")?;

    Ok(projects)
}

/// Update a project's descriptive fields (name only; `repo_path` and
/// `default_branch` are immutable after creation).
pub async fn rename_project(pool: &PgPool, id: Uuid, name: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE projects SET name = $1, updated_at = now() WHERE id = $2")
        .bind(name)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to rename project")?;

    Ok(result.rows_affected())
}
