use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::models::TrainedModel;

const ARTIFACT_FILE_NAME: &str = "model.json";

/// Filesystem home for trained model artifacts, laid out as `<root>/<model_id>/<job_id>/model.json`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create model root at {}", self.root.display()))
    }

    pub fn artifact_path(&self, model_id: &str, job_id: &str) -> PathBuf {
        self.root.join(model_id).join(job_id).join(ARTIFACT_FILE_NAME)
    }

    pub async fn save(&self, job_id: &str, trained: &TrainedModel) -> Result<PathBuf> {
        let path = self.artifact_path(&trained.model_id, job_id);
        ensure_job_dir(&path).await?;
        let body = serde_json::to_vec_pretty(trained).context("Failed to encode trained model")?;
        fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write model artifact {}", path.display()))?;
        Ok(path)
    }

    pub async fn delete(&self, path: &Path) -> Result<()> {
        delete_file_if_exists(path).await
    }
}

async fn ensure_job_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create job directory {}", parent.display()))?;
    }
    Ok(())
}

async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trained() -> TrainedModel {
        TrainedModel {
            algorithm: "naive_bayes".to_string(),
            model_id: "churn".to_string(),
            payload: json!({ "weights": [0.25, 0.75] }),
        }
    }

    #[tokio::test]
    async fn save_writes_json_under_model_and_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let path = store.save("job-1", &trained()).await.expect("save");
        assert_eq!(path, dir.path().join("churn").join("job-1").join("model.json"));
        let raw = std::fs::read(&path).expect("read");
        let stored: TrainedModel = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(stored, trained());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let path = store.save("job-1", &trained()).await.expect("save");

        store.delete(&path).await.expect("first delete");
        store.delete(&path).await.expect("second delete");
        assert!(!path.exists());
    }
}
