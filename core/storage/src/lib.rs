use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use path_clean::PathClean;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

mod thumbnail;

pub use thumbnail::THUMB_EDGE;

/// Namespace under the storage root where image bytes live. Kept flat so
/// relative paths stay stable across restarts.
pub const LOCAL_NAMESPACE: &str = "local";
const THUMB_PREFIX: &str = "thumb_";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Path [{0}] escapes the storage root.")]
    PathEscape(String),
    #[error("Can't decode image payload: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Write-once byte store rooted at `<data_dir>/storage`. Paths handed out
/// are forward-slash relative and safe to expose to local clients.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
    thumbnails: bool,
}

impl LocalStore {
    pub fn new(root: &Path, thumbnails: bool) -> Result<LocalStore> {
        let root = root.to_path_buf();
        fs::create_dir_all(root.join(LOCAL_NAMESPACE))?;
        Ok(LocalStore { root, thumbnails })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `bytes` under the local namespace and returns the relative
    /// path. Unique stems guarantee writers never collide.
    pub fn put(&self, bytes: &[u8], stem: &str, ext: &str) -> Result<String> {
        let relative = format!("{}/{}.{}", LOCAL_NAMESPACE, stem, ext);
        let target = self.resolve(&relative)?;

        let mut file = fs::File::create(&target)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        let mut hasher = Sha3_256::new();
        hasher.input(bytes);
        log::debug!(
            "Stored [{}] ({} bytes, sha3: {:x}).",
            relative,
            bytes.len(),
            hasher.result()
        );
        Ok(relative)
    }

    /// Derives and stores a thumbnail for bytes already persisted under
    /// `owner_stem`. Returns `None` when thumbnailing is disabled.
    pub fn put_thumbnail(&self, bytes: &[u8], owner_stem: &str) -> Result<Option<String>> {
        if !self.thumbnails {
            return Ok(None);
        }
        let thumb = thumbnail::derive(bytes)?;
        let stem = format!("{}{}", THUMB_PREFIX, owner_stem);
        self.put(&thumb, &stem, "jpg").map(Some)
    }

    /// Maps a stored relative path onto the filesystem, rejecting
    /// anything that would leave the storage root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = self.root.join(relative).clean();
        if !candidate.starts_with(&self.root) {
            return Err(StoreError::PathEscape(relative.to_string()));
        }
        Ok(candidate)
    }

    pub fn open(&self, relative: &str) -> Result<fs::File> {
        Ok(fs::File::open(self.resolve(relative)?)?)
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(relative)?)?)
    }

    /// Idempotent removal; a missing entry is not an error.
    pub fn remove(&self, relative: &str) -> Result<()> {
        let target = self.resolve(relative)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
