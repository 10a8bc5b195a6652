use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, info};

use crate::error::{Result, TranscodeError};
use crate::probe;

/// Stable identity of a media file. A rename updates the record's path,
/// not its id, so cache keys derived from a `MediaId` survive renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaId(u64);

impl MediaId {
    #[cfg(test)]
    pub(crate) fn test(raw: u64) -> Self {
        MediaId(raw)
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Video codec of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.265, the modern codec legacy apps cannot decode
    Hevc,
    /// H.264, the legacy-compatible target
    Avc,
    /// Anything else; never a transcode candidate
    Unknown,
}

impl VideoCodec {
    pub fn mime(&self) -> &'static str {
        match self {
            VideoCodec::Hevc => "video/hevc",
            VideoCodec::Avc => "video/avc",
            VideoCodec::Unknown => "application/octet-stream",
        }
    }
}

/// A registered media file: stable id, current path, probed attributes.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub id: MediaId,
    pub path: PathBuf,
    pub codec: VideoCodec,
    pub len: u64,
    /// Bumped whenever the file's content is replaced; cache entries built
    /// from an older token are stale.
    pub mod_token: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    files: HashMap<MediaId, MediaFile>,
    by_path: HashMap<PathBuf, MediaId>,
    next_id: u64,
    next_token: u64,
}

/// Arena of media records. Identity is the integer id, path is a mutable
/// attribute, which is what lets a cache entry keep serving a renamed file
/// without a redundant transcode.
#[derive(Debug, Default)]
pub struct MediaStore {
    inner: RwLock<StoreInner>,
}

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file, probing its codec and size. Re-staging a known path
    /// keeps the existing identity but bumps the modification token, since
    /// the content may have been replaced.
    pub fn stage(&self, path: &Path) -> Result<MediaId> {
        let codec = probe::sniff_codec(path)?;
        let len = std::fs::metadata(path)?.len();

        let mut inner = self.inner.write().expect("media store lock poisoned");
        inner.next_token += 1;
        let token = inner.next_token;

        if let Some(&id) = inner.by_path.get(path) {
            let file = inner.files.get_mut(&id).expect("path index out of sync");
            file.codec = codec;
            file.len = len;
            file.mod_token = token;
            debug!("Re-staged {} as {} (codec {:?}, {} bytes)", path.display(), id, codec, len);
            return Ok(id);
        }

        inner.next_id += 1;
        let id = MediaId(inner.next_id);
        inner.files.insert(
            id,
            MediaFile {
                id,
                path: path.to_path_buf(),
                codec,
                len,
                mod_token: token,
            },
        );
        inner.by_path.insert(path.to_path_buf(), id);
        info!("Staged {} as {} (codec {:?}, {} bytes)", path.display(), id, codec, len);
        Ok(id)
    }

    /// Look up the identity currently bound to a path
    pub fn resolve(&self, path: &Path) -> Option<MediaId> {
        self.inner.read().expect("media store lock poisoned").by_path.get(path).copied()
    }

    /// Snapshot the record for an id, if it still exists
    pub fn get(&self, id: MediaId) -> Option<MediaFile> {
        self.inner.read().expect("media store lock poisoned").files.get(&id).cloned()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }

    pub fn len(&self, path: &Path) -> Option<u64> {
        let inner = self.inner.read().expect("media store lock poisoned");
        let id = inner.by_path.get(path)?;
        inner.files.get(id).map(|f| f.len)
    }

    /// Rename a file on disk and in the arena. Identity and modification
    /// token are untouched; only the path attribute changes.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<MediaId> {
        let mut inner = self.inner.write().expect("media store lock poisoned");
        let id = inner
            .by_path
            .remove(old)
            .ok_or_else(|| TranscodeError::NotFound(old.to_path_buf()))?;
        std::fs::rename(old, new).inspect_err(|_| {
            // Undo the index removal so a failed rename leaves the store intact
            inner.by_path.insert(old.to_path_buf(), id);
        })?;
        inner.by_path.insert(new.to_path_buf(), id);
        let file = inner.files.get_mut(&id).expect("path index out of sync");
        file.path = new.to_path_buf();
        info!("Renamed {} -> {} ({})", old.display(), new.display(), id);
        Ok(id)
    }

    /// Delete a file from disk and drop its record. Returns the retired id
    /// so callers can release cache entries keyed by it.
    pub fn remove(&self, path: &Path) -> Result<MediaId> {
        let mut inner = self.inner.write().expect("media store lock poisoned");
        let id = inner
            .by_path
            .remove(path)
            .ok_or_else(|| TranscodeError::NotFound(path.to_path_buf()))?;
        std::fs::remove_file(path).inspect_err(|_| {
            // Undo the index removal so a failed unlink leaves the store
            // agreeing with the disk
            inner.by_path.insert(path.to_path_buf(), id);
        })?;
        inner.files.remove(&id);
        info!("Deleted {} ({})", path.display(), id);
        Ok(id)
    }

    /// Overwrite a file's content in place. Re-probes the codec and bumps
    /// the modification token; callers are expected to invalidate any cache
    /// entries keyed by the returned id.
    pub fn replace_contents(&self, path: &Path, content: &[u8]) -> Result<MediaId> {
        let id = self
            .resolve(path)
            .ok_or_else(|| TranscodeError::NotFound(path.to_path_buf()))?;
        std::fs::write(path, content)?;
        self.stage(path)?;
        Ok(id)
    }
}
