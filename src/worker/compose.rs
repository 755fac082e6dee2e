use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{FarmError, Result};
use crate::scheduler::job::Job;

/// Post-processing for a completed job whose settings ask for its layer
/// comps to be composited.
#[async_trait]
pub trait Compositor: Send + Sync {
    async fn compose(&self, job: &Job) -> Result<()>;
}

/// Runs an external compositing command over the layer comp folders of a
/// finished render: `program <args...> <layer folder>...`, bottom layer
/// first.
#[derive(Debug, Clone)]
pub struct CommandCompositor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandCompositor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Subfolders of `output` that hold frames, sorted by name.
pub fn layer_folders(output: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(output)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let has_frames = std::fs::read_dir(&path)?.flatten().any(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map(|x| x.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        });
        if has_frames {
            folders.push(path);
        }
    }
    folders.sort();
    Ok(folders)
}

#[async_trait]
impl Compositor for CommandCompositor {
    async fn compose(&self, job: &Job) -> Result<()> {
        let output = job.settings.output_folder(&job.project);
        let extension = job.settings.format.extension().to_string();
        let mut layers = {
            let output = output.clone();
            tokio::task::spawn_blocking(move || layer_folders(&output, &extension))
                .await
                .map_err(|e| FarmError::Compositor(e.to_string()))??
        };
        if layers.len() < 2 {
            return Err(FarmError::Compositor(format!(
                "need at least 2 layer comp folders in {}, found {}",
                output.display(),
                layers.len()
            )));
        }
        if job.settings.reverse_layer_order {
            layers.reverse();
        }

        tracing::info!(job_id = %job.id, layers = layers.len(), "Compositing layer comps");
        let result = Command::new(&self.program)
            .args(&self.args)
            .args(&layers)
            .current_dir(&output)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FarmError::Compositor(format!("{}: {}", self.program.display(), e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(FarmError::Compositor(format!(
                "exit {:?}: {}",
                result.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_only_folders_with_frames() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["fg", "bg", "empty"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("fg").join("f_0001.png"), b"x").unwrap();
        std::fs::write(dir.path().join("bg").join("b_0001.png"), b"x").unwrap();
        std::fs::write(dir.path().join("loose.png"), b"x").unwrap();

        let folders = layer_folders(dir.path(), "png").unwrap();
        let names: Vec<_> = folders
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["bg", "fg"]);
    }
}
