//! Workflow persistence: one pretty-printed `<name>.json` per workflow.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::model::{Workflow, WorkflowDoc};
use super::validate::{ValidationErrors, is_valid_name, validate};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow {name:?} not found")]
    NotFound { name: String },

    #[error("invalid workflow name {name:?}: use alphanumeric, hyphens, underscores")]
    InvalidName { name: String },

    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("parse workflow {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// CRUD over stored workflows. Last write wins.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<WorkflowDoc, WorkflowError>;

    async fn save(&self, workflow: &WorkflowDoc) -> Result<(), WorkflowError>;

    /// Every readable workflow, sorted by name.
    async fn list(&self) -> Result<Vec<WorkflowDoc>, WorkflowError>;

    async fn delete(&self, name: &str) -> Result<(), WorkflowError>;

    /// Load `name` and validate it in one step.
    async fn load_validated(&self, name: &str) -> Result<Workflow, WorkflowError> {
        let doc = self.load(name).await?;
        Ok(validate(&doc)?)
    }
}

/// Directory-backed [`WorkflowStore`].
#[derive(Debug, Clone)]
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, WorkflowError> {
        if !is_valid_name(name) {
            return Err(WorkflowError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

async fn read_doc(path: &Path) -> Result<WorkflowDoc, WorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|source| WorkflowError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn load(&self, name: &str) -> Result<WorkflowDoc, WorkflowError> {
        let path = self.path_for(name)?;
        match read_doc(&path).await {
            Err(WorkflowError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(WorkflowError::NotFound {
                    name: name.to_string(),
                })
            }
            other => other,
        }
    }

    async fn save(&self, workflow: &WorkflowDoc) -> Result<(), WorkflowError> {
        let path = self.path_for(&workflow.name)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = workflow.to_json_pretty()?;
        // Write-then-rename so readers never see a half-written file.
        let tmp = self.dir.join(format!(".{}.json.tmp", workflow.name));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(workflow = %workflow.name, path = %path.display(), "Workflow saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowDoc>, WorkflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workflows = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json")
                || !entry.file_type().await?.is_file()
            {
                continue;
            }
            match read_doc(&path).await {
                Ok(doc) => workflows.push(doc),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable workflow file");
                }
            }
        }
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn delete(&self, name: &str) -> Result<(), WorkflowError> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(workflow = name, "Workflow deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(WorkflowError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
