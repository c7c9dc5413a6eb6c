//! Filesystem-backed content store: one JSON file per document.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::{ContentStore, DocumentContent};

pub struct FileContentStore {
    dir: PathBuf,
}

impl FileContentStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating content directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Directory where content records are persisted.
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, record: &DocumentContent) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        // unique temp name so concurrent saves never share a partial file
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.document_id, Uuid::new_v4()));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, self.path(record.document_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn create(&self, document_id: Uuid, content: &Value) -> Result<()> {
        self.write(&DocumentContent::new(document_id, content.clone()))
            .await
    }

    async fn load(&self, document_id: Uuid) -> Result<Option<DocumentContent>> {
        match fs::read(self.path(document_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("decoding content record for {document_id}")
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document_id: Uuid, content: &Value) -> Result<bool> {
        if !fs::try_exists(self.path(document_id)).await? {
            return Ok(false);
        }
        let record = DocumentContent {
            document_id,
            content: content.clone(),
            updated_at: Utc::now(),
        };
        self.write(&record).await?;
        Ok(true)
    }

    async fn remove(&self, document_id: Uuid) -> Result<()> {
        match fs::remove_file(self.path(document_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn content_survives_reopen() {
        let tempdir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = FileContentStore::new(tempdir.path()).await.unwrap();
            store.create(id, &Value::from("")).await.unwrap();
            assert!(store
                .save(id, &json!({"ops": [{"insert": "hello"}]}))
                .await
                .unwrap());
        }
        let store = FileContentStore::new(tempdir.path()).await.unwrap();
        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.content["ops"][0]["insert"], "hello");
    }

    #[tokio::test]
    async fn missing_records_are_not_created_by_save() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(tempdir.path()).await.unwrap();
        let id = Uuid::new_v4();
        assert!(!store.save(id, &Value::from("x")).await.unwrap());
        assert!(store.load(id).await.unwrap().is_none());
        store.remove(id).await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(tempdir.path()).await.unwrap();
        let id = Uuid::new_v4();
        store.create(id, &Value::from("")).await.unwrap();
        store.remove(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
    }
}
