use std::{path::PathBuf, time::SystemTime};

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, trace};

use super::{FsHandle, ObjectPath};

/// A local-disk object store rooted at a directory.
///
/// Object paths are always `/`-separated; they're joined onto `root` using
/// [`Path::join`] component-wise so that the store behaves the same way on
/// Windows and Unix.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Open a store rooted at `root`, creating the directory if needed.
    #[instrument]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create object store root {root:?}"))?;
        Ok(Self { root })
    }

    /// Open a store at the user-home-rooted cache directory for `project`,
    /// used when no explicit root is configured. Honors `ALTO_CACHE_DIR` as
    /// an override before falling back to the OS cache directory.
    #[instrument]
    pub async fn open_default(project: &str) -> Result<Self> {
        Self::open(default_root(project)?).await
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            full.push(component);
        }
        full
    }
}

/// Linux: `$XDG_CACHE_HOME/<project>`. macOS: `$HOME/Library/Caches/<project>`.
/// Windows: `%LOCALAPPDATA%\<project>`. Overridable with `ALTO_CACHE_DIR`.
pub(crate) fn default_root(project: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("ALTO_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", project)
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .ok_or_else(|| color_eyre::eyre::eyre!("could not determine a home-rooted cache directory"))
}

impl FsHandle for LocalFs {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read object {path}")),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {full:?}"))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("write object {path}"))?;
        trace!(?path, bytes = bytes.len(), "put object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectPath>> {
        let root_dir = self.resolve(prefix);
        let mut out = Vec::new();
        let mut stack = vec![root_dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).with_context(|| format!("list {dir:?}")),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else {
                    let relative = path
                        .strip_prefix(&self.root)
                        .expect("listed path is under root")
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(relative);
                }
            }
        }
        Ok(out)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove object {path}")),
        }
    }

    async fn mtime(&self, path: &str) -> Result<Option<SystemTime>> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat object {path}")),
        }
    }

    async fn rename(&self, tmp: &str, path: &str) -> Result<()> {
        let from = self.resolve(tmp);
        let to = self.resolve(path);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.context("create rename target dir")?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("rename {from:?} to {to:?}"))?;
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<tokio::fs::File> {
        let full = self.resolve(path);
        tokio::fs::File::open(&full).await.with_context(|| format!("open object {path} for streaming read"))
    }

    async fn open_write(&self, path: &str) -> Result<tokio::fs::File> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {full:?}"))?;
        }
        tokio::fs::File::create(&full).await.with_context(|| format!("open object {path} for streaming write"))
    }
}
