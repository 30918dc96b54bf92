//! The filesystem abstraction: a uniform get/put/list/exists interface over
//! whatever object store backs `<root>/alto/<project>/...`.
//!
//! The core ships exactly one driver ([`LocalFs`]), which treats a root
//! directory on disk as the object store. Pointed at a second root, it plays
//! the role of "remote" for single-machine operation and for tests; real
//! remote drivers (S3/GCS/Azure) are out of scope and would implement the
//! same [`FsHandle`] trait.

mod local;

pub use local::LocalFs;
pub(crate) use local::default_root;

use color_eyre::Result;
use std::time::SystemTime;
use tokio::fs::File;

/// A path within the abstract object store, always `/`-separated regardless
/// of host platform, e.g. `"catalogs/tap-x.base.json"`.
pub type ObjectPath = String;

/// Uniform operations over an object store.
///
/// A single handle is shared process-wide. Implementations must be safe for
/// concurrent reads; callers are responsible for serializing writes to the
/// same path (the artifact cache and state store do this via lock files and
/// write-temp-then-rename, respectively).
pub trait FsHandle: Clone + Send + Sync + 'static {
    fn exists(&self, path: &str) -> impl Future<Output = Result<bool>> + Send;
    fn get(&self, path: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
    fn put(&self, path: &str, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
    /// List all object paths under `prefix`.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<ObjectPath>>> + Send;
    fn remove(&self, path: &str) -> impl Future<Output = Result<()>> + Send;
    fn mtime(&self, path: &str) -> impl Future<Output = Result<Option<SystemTime>>> + Send;

    /// Atomically rename `tmp` into place at `path` within the store. Used
    /// by the state store and reservoir index for crash-safe write-back.
    fn rename(&self, tmp: &str, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Open `path` for a streaming read. The large blobs this store exists
    /// for — reservoir partitions, plugin artifacts — go through this
    /// instead of buffering the whole object into memory via [`Self::get`].
    fn open_read(&self, path: &str) -> impl Future<Output = Result<File>> + Send;

    /// Open `path` for a streaming write, creating parent directories as
    /// needed and truncating any existing object at `path`.
    fn open_write(&self, path: &str) -> impl Future<Output = Result<File>> + Send;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A behavioral contract test suite any [`FsHandle`] implementation
    /// should pass; exercised against [`LocalFs`] below, and available for
    /// a future remote driver to reuse.
    pub async fn exercise_contract(fs: impl FsHandle) {
        assert!(!fs.exists("a/b.json").await.unwrap());
        assert_eq!(fs.get("a/b.json").await.unwrap(), None);

        fs.put("a/b.json", b"{}").await.unwrap();
        assert!(fs.exists("a/b.json").await.unwrap());
        assert_eq!(fs.get("a/b.json").await.unwrap(), Some(b"{}".to_vec()));
        assert!(fs.mtime("a/b.json").await.unwrap().is_some());

        {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut writer = fs.open_write("a/streamed.json").await.unwrap();
            writer.write_all(b"[1,2,3]").await.unwrap();
            writer.flush().await.unwrap();
            drop(writer);

            let mut reader = fs.open_read("a/streamed.json").await.unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"[1,2,3]");
        }

        fs.put("a/c.json", b"{}").await.unwrap();
        let mut listed = fs.list("a").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a/b.json".to_string(), "a/c.json".to_string()]);

        fs.remove("a/b.json").await.unwrap();
        assert!(!fs.exists("a/b.json").await.unwrap());
    }
}
