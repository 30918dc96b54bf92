//! Artifact Cache: content-addressed plugin-artifact build, local cache, and
//! promotion to remote storage.

use std::{marker::PhantomData, path::PathBuf, sync::Arc};

use color_eyre::{Result, eyre::Context};
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::{
    config::PluginSpec,
    error::AltoError,
    fingerprint::{Fingerprint, PluginFingerprintInputs, plugin_fingerprint},
    fs::FsHandle,
};

/// Sets the lock file's typestate to "not currently held".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Unlocked;

/// Sets the lock file's typestate to "held by this handle".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Locked;

/// A build-coordination lock file, named by plugin fingerprint.
///
/// Lock with [`LockFile::lock`], unlock with [`LockFile::unlock`]. The
/// typestate prevents double-locking or double-unlocking at compile time.
#[derive(Debug, Clone)]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

impl LockFile<Unlocked> {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("create lock directory")?;
        }
        let opened = path.clone();
        let file = spawn_blocking(move || FsLockFile::open(&opened))
            .await
            .context("join task")?
            .context("open lock file")?;
        Ok(Self { state: PhantomData, path, inner: Arc::new(Mutex::new(file)) })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().lock().context("lock file")?;
            Ok(LockFile { state: PhantomData, inner: self.inner, path: self.path })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked build coordination file"))
    }
}

impl LockFile<Locked> {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().unlock().context("unlock file")?;
            Ok(LockFile { state: PhantomData, inner: self.inner, path: self.path })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked build coordination file"))
    }
}

/// The package-manager-specific collaborator that actually installs a
/// plugin: pip, npm, a local symlink, whatever `spec.install_url` names. The
/// cache owns fingerprinting, locking, and promotion; this trait owns
/// everything downstream of "here is a spec, give me an executable's bytes."
pub trait Packager: Clone + Send + Sync + 'static {
    fn build(&self, spec: &PluginSpec) -> impl Future<Output = Result<Vec<u8>, AltoError>> + Send;
}

/// Build-once/cache-forever coordination over a local cache directory and a
/// remote [`FsHandle`].
#[derive(Clone)]
pub struct ArtifactCache<R: FsHandle, P: Packager> {
    local_root: PathBuf,
    remote: R,
    packager: P,
    interpreter_major_minor: String,
    arch_tag: String,
}

impl<R: FsHandle, P: Packager> ArtifactCache<R, P> {
    pub fn new(local_root: PathBuf, remote: R, packager: P, interpreter_major_minor: String, arch_tag: String) -> Self {
        Self { local_root, remote, packager, interpreter_major_minor, arch_tag }
    }

    fn fingerprint(&self, spec: &PluginSpec) -> Fingerprint {
        plugin_fingerprint(PluginFingerprintInputs {
            install_url: &spec.install_url,
            executable_or_entrypoint: spec.executable_or_entrypoint(),
            interpreter_major_minor: &self.interpreter_major_minor,
            arch_tag: &self.arch_tag,
        })
    }

    fn local_path(&self, fp: Fingerprint) -> PathBuf {
        self.local_root.join("plugins").join(fp.as_hex())
    }

    fn lock_path(&self, fp: Fingerprint) -> PathBuf {
        self.local_root.join("locks").join(format!("{}.lock", fp.as_hex()))
    }

    /// The remote object path `spec`'s built artifact is promoted to, for
    /// callers (the task engine) that need to check existence without
    /// going through [`ArtifactCache::get_or_build`].
    pub fn remote_object_path(&self, spec: &PluginSpec) -> crate::fs::ObjectPath {
        format!("plugins/{}", self.fingerprint(spec).as_hex())
    }

    /// Return the local path to `spec`'s built artifact, building it (and
    /// promoting it to remote) if this is the first time this fingerprint
    /// has been requested anywhere.
    #[instrument(skip(self, spec), fields(plugin = %spec.name))]
    pub async fn get_or_build(&self, spec: &PluginSpec) -> Result<PathBuf> {
        let fp = self.fingerprint(spec);
        let local_path = self.local_path(fp);

        if tokio::fs::try_exists(&local_path).await? {
            trace!(%fp, "artifact cache hit (local)");
            return Ok(local_path);
        }

        let remote_path = format!("plugins/{}", fp.as_hex());
        if self.remote.exists(&remote_path).await? {
            trace!(%fp, "artifact cache hit (remote)");
            stream_artifact_from_remote(&self.remote, &remote_path, &local_path).await?;
            return Ok(local_path);
        }

        let lock = LockFile::open(self.lock_path(fp)).await?.lock().await?;

        // Another process may have finished the build while we waited.
        if tokio::fs::try_exists(&local_path).await? {
            lock.unlock().await?;
            return Ok(local_path);
        }

        let build = self.packager.build(spec).await;
        let bytes = match build {
            Ok(bytes) => bytes,
            Err(err) => {
                lock.unlock().await?;
                return Err(err.into());
            }
        };

        write_executable(&local_path, &bytes).await?;
        promote_artifact_to_remote(&self.remote, &local_path, &remote_path).await.context("promote built artifact to remote")?;
        lock.unlock().await?;

        Ok(local_path)
    }
}

/// Write `bytes` to `path` and mark it executable (a no-op for the
/// permission bits on Windows, where executability isn't bit-encoded).
async fn write_executable(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.context("create artifact directory")?;
    }
    tokio::fs::write(path, bytes).await.with_context(|| format!("write artifact to {path:?}"))?;
    set_executable(path).await
}

#[cfg(not(target_os = "windows"))]
async fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let metadata = tokio::fs::metadata(path).await.context("stat artifact")?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    tokio::fs::set_permissions(path, permissions).await.context("set artifact executable bit")?;
    Ok(())
}

#[cfg(target_os = "windows")]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

/// Stream a remote-cache-hit artifact straight into the local cache without
/// buffering the whole (potentially large) executable into memory.
async fn stream_artifact_from_remote(remote: &impl FsHandle, remote_path: &str, local_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await.context("create artifact directory")?;
    }
    let mut reader = remote.open_read(remote_path).await.with_context(|| format!("open remote artifact {remote_path}"))?;
    let mut writer = tokio::fs::File::create(local_path).await.with_context(|| format!("create local artifact {local_path:?}"))?;
    tokio::io::copy(&mut reader, &mut writer).await.context("stream remote artifact into local cache")?;
    use tokio::io::AsyncWriteExt as _;
    writer.flush().await.context("flush local artifact")?;
    drop(writer);
    set_executable(local_path).await
}

/// Stream a freshly built local artifact up to remote storage without
/// re-buffering the bytes already persisted on disk.
async fn promote_artifact_to_remote(remote: &impl FsHandle, local_path: &std::path::Path, remote_path: &str) -> Result<()> {
    let mut reader =
        tokio::fs::File::open(local_path).await.with_context(|| format!("reopen built artifact {local_path:?}"))?;
    let mut writer = remote.open_write(remote_path).await.with_context(|| format!("open remote artifact {remote_path} for writing"))?;
    tokio::io::copy(&mut reader, &mut writer).await.context("stream built artifact to remote")?;
    use tokio::io::AsyncWriteExt as _;
    writer.flush().await.context("flush remote artifact")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::plugin::PluginKind, fs::LocalFs};
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn spec(name: &str) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            kind: PluginKind::Tap,
            install_url: "pkg-x==1.0".to_string(),
            executable: Some(name.to_string()),
            entrypoint: None,
            capabilities: BTreeSet::new(),
            config: crate::config::ConfigValue::empty_map(),
            select: Vec::new(),
            metadata: Vec::new(),
            stream_maps: Vec::new(),
            env: BTreeMap::new(),
            load_path: None,
            accents: BTreeMap::new(),
            inherit_from: None,
        }
    }

    #[derive(Clone)]
    struct CountingPackager {
        calls: Arc<AtomicUsize>,
    }

    impl Packager for CountingPackager {
        async fn build(&self, _spec: &PluginSpec) -> Result<Vec<u8>, AltoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"#!/bin/sh\necho hi\n".to_vec())
        }
    }

    #[derive(Clone)]
    struct FailingPackager;

    impl Packager for FailingPackager {
        async fn build(&self, spec: &PluginSpec) -> Result<Vec<u8>, AltoError> {
            Err(AltoError::BuildFailure {
                plugin: spec.name.clone(),
                message: "install script exited 1".to_string(),
                log: "pip: no such package".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn second_call_is_a_local_cache_hit() {
        let local = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = LocalFs::open(remote_dir.path()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ArtifactCache::new(
            local.path().to_path_buf(),
            remote,
            CountingPackager { calls: calls.clone() },
            "3.11".to_string(),
            "x86_64-linux".to_string(),
        );

        let spec = spec("tap-x");
        let first = cache.get_or_build(&spec).await.unwrap();
        let second = cache.get_or_build(&spec).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_hit_avoids_rebuilding() {
        let local = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = LocalFs::open(remote_dir.path()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ArtifactCache::new(
            local.path().to_path_buf(),
            remote.clone(),
            CountingPackager { calls: calls.clone() },
            "3.11".to_string(),
            "x86_64-linux".to_string(),
        );

        let spec = spec("tap-x");
        let fp = cache.fingerprint(&spec);
        remote.put(&format!("plugins/{}", fp.as_hex()), b"#!/bin/sh\necho cached\n").await.unwrap();

        let path = cache.get_or_build(&spec).await.unwrap();
        assert!(tokio::fs::try_exists(&path).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn build_failure_surfaces_and_does_not_cache() {
        let local = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = LocalFs::open(remote_dir.path()).await.unwrap();
        let cache = ArtifactCache::new(
            local.path().to_path_buf(),
            remote,
            FailingPackager,
            "3.11".to_string(),
            "x86_64-linux".to_string(),
        );

        let err = cache.get_or_build(&spec("tap-x")).await.unwrap_err();
        assert!(err.downcast_ref::<AltoError>().is_some_and(|e| matches!(e, AltoError::BuildFailure { .. })));
    }
}
