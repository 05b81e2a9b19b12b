//! Filesystem side of a job: one directory per job under the data root.
//!
//! Every write goes to a hidden temp file unique to that write and is renamed
//! into place, so a reader never sees a half-written artifact and two writers
//! of the same name never share a temp file. Removal is confined to job
//! directories under the data root.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use docflow_core::JobId;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),
    #[error("refusing to remove {0}: not a directory under the data root")]
    OutsideRoot(PathBuf),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    data_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.data_root.join(id.simple())
    }

    pub async fn create_job_directory(&self, id: JobId) -> Result<PathBuf, ArtifactError> {
        let dir = self.job_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ArtifactError::io(&dir, e))?;
        Ok(dir)
    }

    /// Store the uploaded input bytes as `file_name` in the job directory.
    pub async fn save_input_atomic(
        &self,
        id: JobId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        self.write_atomic(id, file_name, bytes).await
    }

    pub async fn save_text_atomic(
        &self,
        id: JobId,
        file_name: &str,
        content: &str,
    ) -> Result<PathBuf, ArtifactError> {
        self.write_atomic(id, file_name, content.as_bytes()).await
    }

    async fn write_atomic(
        &self,
        id: JobId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        validate_name(file_name)?;
        let dir = self.create_job_directory(id).await?;
        let target = dir.join(file_name);
        let tmp = dir.join(format!(".{file_name}.{}.tmp", JobId::new().simple()));

        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            discard_tmp(&tmp).await;
            return Err(ArtifactError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            discard_tmp(&tmp).await;
            return Err(ArtifactError::io(&target, e));
        }

        debug!(job_id = %id, path = %target.display(), bytes = bytes.len(), "artifact written");
        Ok(target)
    }

    /// Remove a job directory. A directory that is already gone is not an
    /// error; anything that is not strictly inside the data root is refused.
    pub async fn remove_dir(&self, dir: &Path) -> Result<bool, ArtifactError> {
        if !self.contains(dir) {
            return Err(ArtifactError::OutsideRoot(dir.to_path_buf()));
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArtifactError::io(dir, e)),
        }
    }

    /// Create the data root if needed and prove it accepts writes.
    pub async fn check_writable(&self) -> Result<(), ArtifactError> {
        tokio::fs::create_dir_all(&self.data_root)
            .await
            .map_err(|e| ArtifactError::io(&self.data_root, e))?;
        let marker = self
            .data_root
            .join(format!(".write-check-{}", JobId::new().simple()));
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(|e| ArtifactError::io(&marker, e))?;
        tokio::fs::remove_file(&marker)
            .await
            .map_err(|e| ArtifactError::io(&marker, e))
    }

    /// True for paths strictly below the data root with no `..` hops.
    fn contains(&self, dir: &Path) -> bool {
        dir != self.data_root
            && dir.starts_with(&self.data_root)
            && !dir.components().any(|c| c == Component::ParentDir)
    }
}

async fn discard_tmp(tmp: &Path) {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %tmp.display(), error = %e, "failed to remove temp artifact"),
    }
}

fn validate_name(file_name: &str) -> Result<(), ArtifactError> {
    let ok = !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && !file_name.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(file_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_is_written_atomically_into_the_job_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let id = JobId::new();

        let path = store.save_text_atomic(id, "error.txt", "timeout").await.unwrap();

        assert_eq!(path, store.job_dir(id).join("error.txt"));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "timeout");
        let leftovers: Vec<_> = std::fs::read_dir(store.job_dir(id))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("error.txt")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_of_one_name_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let id = JobId::new();

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..16 {
            let store = store.clone();
            tasks.spawn(async move {
                let body = format!("writer {n} ").repeat(4096);
                store.save_text_atomic(id, "output.json", &body).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let content = tokio::fs::read_to_string(store.job_dir(id).join("output.json"))
            .await
            .unwrap();
        assert!((0..16).any(|n| content == format!("writer {n} ").repeat(4096)));
        assert_eq!(std::fs::read_dir(store.job_dir(id)).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let id = JobId::new();

        store.save_input_atomic(id, "input.pdf", b"first").await.unwrap();
        let path = store.save_input_atomic(id, "input.pdf", b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn rejects_names_escaping_the_job_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        for name in ["", "..", "../x", "a/b"] {
            assert!(matches!(
                store.save_text_atomic(JobId::new(), name, "x").await,
                Err(ArtifactError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn removing_a_missing_dir_is_fine() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.create_job_directory(JobId::new()).await.unwrap();

        assert!(store.remove_dir(&dir).await.unwrap());
        assert!(!store.remove_dir(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn removal_outside_the_data_root_is_refused() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let escaping = root.path().join("..").join(outside.path().file_name().unwrap());

        for dir in [outside.path().to_path_buf(), root.path().to_path_buf(), escaping] {
            assert!(matches!(
                store.remove_dir(&dir).await,
                Err(ArtifactError::OutsideRoot(_))
            ));
        }
        assert!(outside.path().is_dir());
        assert!(root.path().is_dir());
    }

    #[tokio::test]
    async fn writability_check_creates_root() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path().join("nested"));
        store.check_writable().await.unwrap();
        assert!(root.path().join("nested").is_dir());
    }
}
