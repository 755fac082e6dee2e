//! Project bundles for nodes that cannot see the submitter's files.
//!
//! A bundle is a zip holding the project file, and optionally everything
//! else in the project's folder, with paths relative to that folder.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{FarmError, Result};
use crate::scheduler::job::JobId;

/// Build a bundle for `project`. With `include_siblings` every file under
/// the project's folder goes in, so images and audio referenced relatively
/// still resolve on the rendering node.
pub fn bundle_project(project: &Path, include_siblings: bool, max_bytes: usize) -> Result<Vec<u8>> {
    let root = project
        .parent()
        .ok_or_else(|| FarmError::Transfer(format!("{} has no parent folder", project.display())))?;
    if !project.is_file() {
        return Err(FarmError::Transfer(format!(
            "project file not found: {}",
            project.display()
        )));
    }

    let files = if include_siblings {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        files.sort();
        files
    } else {
        vec![project.to_path_buf()]
    };

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut total = 0usize;
    for file in &files {
        let relative = file
            .strip_prefix(root)
            .map_err(|e| FarmError::Transfer(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(file)?;
        total += bytes.len();
        if total > max_bytes {
            return Err(FarmError::Transfer(format!(
                "bundle for {} exceeds {} bytes",
                project.display(),
                max_bytes
            )));
        }
        writer.start_file(name, options)?;
        writer.write_all(&bytes)?;
    }
    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Unpack a bundle into `dest`. Entries that would land outside `dest`
/// are rejected, and so is a bundle that unpacks to more than `max_bytes`.
/// Sizes declared in the archive are not trusted.
pub fn extract_bundle(bytes: &[u8], dest: &Path, max_bytes: usize) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    std::fs::create_dir_all(dest)?;
    let mut extracted = 0;
    let mut remaining = max_bytes as u64;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(FarmError::Transfer(format!(
                "unsafe path in bundle: {}",
                entry.name()
            )));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut data = Vec::new();
        (&mut entry).take(remaining + 1).read_to_end(&mut data)?;
        if data.len() as u64 > remaining {
            return Err(FarmError::Transfer(format!(
                "bundle unpacks to more than {} bytes",
                max_bytes
            )));
        }
        remaining -= data.len() as u64;
        std::fs::write(&target, data)?;
        extracted += 1;
    }
    Ok(extracted)
}

/// Master-side storage for uploaded bundles, one file per job.
#[derive(Debug, Clone)]
pub struct TransferStore {
    dir: PathBuf,
}

impl TransferStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.zip", job_id))
    }

    pub async fn put(&self, job_id: &JobId, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(job_id);
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(job_id = %job_id, bytes = bytes.len(), "Bundle stored");
        Ok(())
    }

    /// The stored bundle, or `None` if there is none for this job.
    pub async fn get(&self, job_id: &JobId) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(job_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, job_id: &JobId) -> bool {
        tokio::fs::try_exists(self.path_for(job_id))
            .await
            .unwrap_or(false)
    }

    pub async fn delete(&self, job_id: &JobId) {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "Bundle deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to delete bundle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("shot.moho");
        std::fs::write(&project, b"scene").unwrap();
        std::fs::create_dir(dir.path().join("Images")).unwrap();
        std::fs::write(dir.path().join("Images").join("bg.png"), b"png").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        (dir, project)
    }

    #[test]
    fn bundle_with_siblings() {
        let (_dir, project) = project_tree();
        let bytes = bundle_project(&project, true, 1 << 20).unwrap();

        let out = tempfile::tempdir().unwrap();
        assert_eq!(extract_bundle(&bytes, out.path(), 1 << 20).unwrap(), 2);
        assert_eq!(std::fs::read(out.path().join("shot.moho")).unwrap(), b"scene");
        assert_eq!(
            std::fs::read(out.path().join("Images").join("bg.png")).unwrap(),
            b"png"
        );
        assert!(!out.path().join(".hidden").exists());
    }

    #[test]
    fn bundle_project_only() {
        let (_dir, project) = project_tree();
        let bytes = bundle_project(&project, false, 1 << 20).unwrap();
        let out = tempfile::tempdir().unwrap();
        assert_eq!(extract_bundle(&bytes, out.path(), 1 << 20).unwrap(), 1);
        assert!(!out.path().join("Images").exists());
    }

    #[test]
    fn bundle_size_limit() {
        let (_dir, project) = project_tree();
        assert!(matches!(
            bundle_project(&project, true, 4),
            Err(FarmError::Transfer(_))
        ));
    }

    #[test]
    fn garbage_is_a_transfer_error() {
        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_bundle(b"not a zip", out.path(), 1 << 20),
            Err(FarmError::Transfer(_))
        ));
    }

    #[test]
    fn oversized_bundle_is_refused_while_unpacking() {
        let (_dir, project) = project_tree();
        let bytes = bundle_project(&project, true, 1 << 20).unwrap();

        // "scene" plus "png" is 8 bytes.
        let out = tempfile::tempdir().unwrap();
        assert_eq!(extract_bundle(&bytes, out.path(), 8).unwrap(), 2);
        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_bundle(&bytes, out.path(), 7),
            Err(FarmError::Transfer(msg)) if msg.contains("more than 7 bytes")
        ));
    }

    #[tokio::test]
    async fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransferStore::new(dir.path().join("transfers"));
        let id = JobId::new();
        assert!(store.get(&id).await.unwrap().is_none());
        store.put(&id, b"zip").await.unwrap();
        assert!(store.exists(&id).await);
        assert_eq!(store.get(&id).await.unwrap().unwrap(), b"zip");
        store.delete(&id).await;
        assert!(!store.exists(&id).await);
    }
}
