//! Provenance writer: records a receipt of each step's execution next to
//! the repo it touched.
//!
//! Grounded on the lifecycle module's existing JSON-serialisation idiom
//! (small, typed struct -> `serde_json::to_string_pretty` -> file write).
//! Written under `<repo>/.hyperagent/workflow-logs/` so it survives
//! independently of the durable store and can be inspected by tooling
//! that has no database access.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One provenance record for a single step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    pub workflow_id: Uuid,
    pub project_id: Uuid,
    pub step_id: String,
    pub repository_path: String,
    pub workspace_path: String,
    pub agent_run_id: Uuid,
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Write `record` to `<repo_path>/.hyperagent/workflow-logs/workflow-<ts>-<rand>.json`.
///
/// Returns the path written to.
pub fn write_provenance(repo_path: &Path, record: &ProvenanceRecord) -> Result<PathBuf> {
    let dir = repo_path.join(".hyperagent").join("workflow-logs");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create provenance directory {}", dir.display()))?;

    let file_name = format!(
        "workflow-{}-{}.json",
        record.created_at.timestamp(),
        &record.agent_run_id.simple().to_string()[..8],
    );
    let path = dir.join(file_name);

    let json = serde_json::to_string_pretty(record).context("failed to serialise provenance record")?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write provenance file {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_provenance_creates_expected_file() {
        let tmp = tempfile::tempdir().unwrap();
        let record = ProvenanceRecord {
            workflow_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            step_id: "wf:task-a".to_string(),
            repository_path: tmp.path().to_string_lossy().to_string(),
            workspace_path: "/tmp/ws".to_string(),
            agent_run_id: Uuid::new_v4(),
            commit_hash: Some("deadbeef".to_string()),
            created_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let path = write_provenance(tmp.path(), &record).unwrap();
        assert!(path.exists());
        assert!(path.starts_with(tmp.path().join(".hyperagent").join("workflow-logs")));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"workflowId\""));
        assert!(contents.contains("\"stepId\""));
        assert!(contents.contains("\"commitHash\""));
        assert!(!contents.contains("workflow_id"));

        let parsed: ProvenanceRecord = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.step_id, "wf:task-a");
        assert_eq!(parsed.commit_hash.as_deref(), Some("deadbeef"));
    }
}
