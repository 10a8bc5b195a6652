use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::capability::TargetProfile;
use crate::codec::CodecService;
use crate::error::{Result, TranscodeError};
use crate::media::MediaId;

/// Unit of transcode deduplication: one artifact, one build lock, per
/// (source identity, target profile). Two apps whose effective
/// capabilities demand the same profile for the same file share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranscodeKey {
    pub media: MediaId,
    pub profile: TargetProfile,
}

impl fmt::Display for TranscodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.media, self.profile.tag())
    }
}

/// Lifecycle of a cache entry's artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No artifact; nothing has been built (or a failed build was reset)
    Empty,
    /// A producer task is streaming bytes into the artifact
    InProgress,
    /// The artifact is complete and byte length is known
    Ready,
    /// The source was deleted or replaced; the artifact must not be served
    Invalid,
}

/// Producer-side progress published to every reader of an in-flight build
#[derive(Debug, Clone, Default)]
pub(crate) struct BuildProgress {
    pub bytes: u64,
    pub done: bool,
    pub error: Option<String>,
    /// The entry was invalidated or deleted while this build ran; its
    /// output was discarded and waiters must not treat it as a codec fault
    pub invalidated: bool,
}

/// Write side of an in-flight build: appends codec output to the artifact
/// and publishes how many bytes readers may consume.
pub struct BuildSink {
    file: tokio::fs::File,
    written: u64,
    tx: watch::Sender<BuildProgress>,
}

impl BuildSink {
    pub(crate) fn new(file: tokio::fs::File, tx: watch::Sender<BuildProgress>) -> Self {
        Self {
            file,
            written: 0,
            tx,
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.file.write_all(chunk).await?;
        // Flush so readers opening the artifact see the bytes we announce
        self.file.flush().await?;
        self.written += chunk.len() as u64;
        let written = self.written;
        self.tx.send_modify(|p| p.bytes = written);
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

#[derive(Debug)]
struct EntryInner {
    state: EntryState,
    bytes_total: Option<u64>,
    /// Modification token of the source the artifact was (or is being)
    /// built from; a mismatch on access means the content was replaced
    source_token: u64,
    /// Bumped on every transition into `InProgress`. A producer may only
    /// commit or clean up if its generation is still current, so a build
    /// that raced an invalidation never clobbers its successor's artifact.
    generation: u64,
    rx: Option<watch::Receiver<BuildProgress>>,
}

/// One cached transcoded artifact. At most one exists per [`TranscodeKey`],
/// and at most one build is ever in flight for it; concurrent readers all
/// observe the same terminal artifact or the same failure.
#[derive(Debug)]
pub struct CacheEntry {
    key: TranscodeKey,
    artifact: PathBuf,
    inner: Mutex<EntryInner>,
    readers: AtomicUsize,
}

impl CacheEntry {
    fn new(key: TranscodeKey, artifact: PathBuf) -> Self {
        Self {
            key,
            artifact,
            inner: Mutex::new(EntryInner {
                state: EntryState::Empty,
                bytes_total: None,
                source_token: 0,
                generation: 0,
                rx: None,
            }),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> TranscodeKey {
        self.key
    }

    pub fn state(&self) -> EntryState {
        self.lock().state
    }

    /// Byte length of the artifact once the build has completed
    pub fn len(&self) -> Option<u64> {
        self.lock().bytes_total
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Detach a reader. The last reader off an invalidated entry reclaims
    /// the artifact, so an open handle keeps its backing file readable
    /// until it is closed even after a delete.
    pub(crate) fn detach_reader(&self) {
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1
            && self.lock().state == EntryState::Invalid
        {
            match std::fs::remove_file(&self.artifact) {
                Ok(()) => debug!("Reclaimed artifact {} on last detach", self.key),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "Failed to reclaim artifact {}: {}",
                    self.artifact.display(),
                    err
                ),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryInner> {
        self.inner.lock().expect("cache entry lock poisoned")
    }
}

/// Maps (source identity, target profile) to cached transcoded artifacts,
/// enforcing at-most-one in-flight build per key. Mutual exclusion is per
/// key, never file-global, so unrelated profiles transcode in parallel.
pub struct TranscodeCache {
    cache_dir: PathBuf,
    codec: Arc<dyn CodecService>,
    entries: DashMap<TranscodeKey, Arc<CacheEntry>>,
    read_wait: Duration,
}

impl TranscodeCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        codec: Arc<dyn CodecService>,
        read_wait: Duration,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            codec,
            entries: DashMap::new(),
            read_wait,
        })
    }

    /// Get or atomically create the entry for a key. Creation registers the
    /// artifact path but produces no bytes; the codec service runs only
    /// when a reader first needs data.
    pub fn entry(&self, key: TranscodeKey) -> Arc<CacheEntry> {
        self.entries
            .entry(key)
            .or_insert_with(|| {
                let artifact = self
                    .cache_dir
                    .join(format!("{}-{}.mp4", key.media, key.profile.tag()));
                debug!("Created cache entry {} -> {}", key, artifact.display());
                Arc::new(CacheEntry::new(key, artifact))
            })
            .clone()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Start the build for an entry unless one is in flight or a current
    /// artifact already exists. The first caller past this point becomes
    /// the producer; everyone else joins its progress channel.
    pub(crate) fn ensure_started(&self, entry: &Arc<CacheEntry>, source: &Path, source_token: u64) {
        let mut inner = entry.lock();
        match inner.state {
            EntryState::Ready if inner.source_token == source_token => return,
            EntryState::InProgress => return,
            // Empty, Invalid, or Ready against a stale token: rebuild
            _ => {}
        }

        let (tx, rx) = watch::channel(BuildProgress::default());
        inner.state = EntryState::InProgress;
        inner.source_token = source_token;
        inner.bytes_total = None;
        inner.generation += 1;
        let generation = inner.generation;
        inner.rx = Some(rx);
        drop(inner);

        info!("Starting transcode build {} from {}", entry.key, source.display());
        let entry = Arc::clone(entry);
        let codec = Arc::clone(&self.codec);
        let source = source.to_path_buf();
        tokio::spawn(run_build(entry, codec, source, generation, tx));
    }

    /// Read artifact bytes at an offset, suspending while the producer has
    /// not yet written them. Returns `Ok(0)` at end of artifact. A reader
    /// abandoning this wait never disturbs the build other readers share.
    pub(crate) async fn read_at(
        &self,
        entry: &CacheEntry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let (state, total, rx) = {
                let inner = entry.lock();
                (inner.state, inner.bytes_total, inner.rx.clone())
            };
            match state {
                EntryState::Ready => {
                    let total = total.unwrap_or(0);
                    if offset >= total {
                        return Ok(0);
                    }
                    let upto = buf.len().min((total - offset) as usize);
                    return read_file_at(&entry.artifact, offset, &mut buf[..upto]).await;
                }
                EntryState::Invalid => return Err(TranscodeError::Invalidated),
                EntryState::Empty | EntryState::InProgress => {
                    let Some(mut rx) = rx else {
                        // Never started; there is nothing to serve
                        return Err(TranscodeError::Invalidated);
                    };
                    let progress = rx.borrow_and_update().clone();
                    if progress.invalidated {
                        return Err(TranscodeError::Invalidated);
                    }
                    if let Some(msg) = progress.error {
                        return Err(TranscodeError::CodecFailure(msg));
                    }
                    if progress.bytes > offset {
                        let upto = buf.len().min((progress.bytes - offset) as usize);
                        return read_file_at(&entry.artifact, offset, &mut buf[..upto]).await;
                    }
                    if progress.done {
                        return Ok(0);
                    }
                    match tokio::time::timeout(self.read_wait, rx.changed()).await {
                        Err(_) => return Err(TranscodeError::Timeout),
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            // Producer gone. A clean finish always publishes a
                            // terminal progress first; anything else is a crash.
                            let last = rx.borrow().clone();
                            if last.error.is_none() && !last.done {
                                return Err(TranscodeError::CodecFailure(
                                    "transcode task ended unexpectedly".into(),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    /// The source content behind a media identity was replaced; force
    /// regeneration on next access for every profile built from it.
    pub fn invalidate(&self, media: MediaId) {
        for item in self.entries.iter() {
            if item.key().media == media {
                let entry = item.value();
                let mut inner = entry.lock();
                inner.state = EntryState::Invalid;
                inner.bytes_total = None;
                debug!("Invalidated cache entry {}", entry.key);
            }
        }
    }

    /// The media identity was deleted. Entries are released immediately so
    /// no access path can observe the artifact; a build already in flight
    /// discards its result instead of committing.
    pub fn on_delete(&self, media: MediaId) {
        let keys: Vec<TranscodeKey> = self
            .entries
            .iter()
            .filter(|e| e.key().media == media)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                {
                    let mut inner = entry.lock();
                    inner.state = EntryState::Invalid;
                    inner.bytes_total = None;
                }
                // Open handles keep the artifact on disk; the last one off
                // the entry reclaims it on detach
                let readers = entry.reader_count();
                if readers > 0 {
                    debug!(
                        "Released cache entry {} with {} open handle(s) still attached",
                        key, readers
                    );
                } else if let Err(err) = std::fs::remove_file(&entry.artifact) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove artifact {}: {}", entry.artifact.display(), err);
                    }
                }
                info!("Released cache entry {}", key);
            }
        }
    }

    /// A media identity changed path. Identity is path-independent, so the
    /// entries stay keyed as they are and lookups under the new path keep
    /// hitting the same artifacts without a redundant transcode.
    pub fn on_rename(&self, media: MediaId) {
        let retained = self.entries.iter().filter(|e| e.key().media == media).count();
        debug!("Rename of {}: {} cache entries retained", media, retained);
    }
}

async fn run_build(
    entry: Arc<CacheEntry>,
    codec: Arc<dyn CodecService>,
    source: PathBuf,
    generation: u64,
    tx: watch::Sender<BuildProgress>,
) {
    let result = async {
        let file = tokio::fs::File::create(&entry.artifact).await?;
        let mut sink = BuildSink::new(file, tx.clone());
        codec.transcode(&source, entry.key.profile, &mut sink).await?;
        Ok::<u64, TranscodeError>(sink.bytes_written())
    }
    .await;

    let mut inner = entry.lock();
    let current = inner.state == EntryState::InProgress && inner.generation == generation;
    match result {
        Ok(written) if current => {
            inner.state = EntryState::Ready;
            inner.bytes_total = Some(written);
            drop(inner);
            info!("Transcode build {} complete: {} bytes", entry.key, written);
            tx.send_modify(|p| {
                p.bytes = written;
                p.done = true;
            });
        }
        Ok(_) => {
            // Invalidated or deleted while finishing. The artifact is left
            // alone: a successor build may already own the path, and a
            // deleted entry reclaims it through its reader count.
            drop(inner);
            warn!("Discarding completed build {}: entry no longer current", entry.key);
            tx.send_modify(|p| {
                p.done = true;
                p.invalidated = true;
            });
        }
        Err(err) if current => {
            let msg = err.to_string();
            // Reset so a later open can retry
            inner.state = EntryState::Empty;
            drop(inner);
            let _ = std::fs::remove_file(&entry.artifact);
            warn!("Transcode build {} failed: {}", entry.key, msg);
            tx.send_modify(|p| {
                p.done = true;
                p.error = Some(msg);
            });
        }
        Err(err) => {
            drop(inner);
            warn!(
                "Discarding failed build {} ({}): entry no longer current",
                entry.key, err
            );
            tx.send_modify(|p| {
                p.done = true;
                p.invalidated = true;
            });
        }
    }
}

async fn read_file_at(path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let n = file.read(buf).await?;
    Ok(n)
}
