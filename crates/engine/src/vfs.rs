use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::cache::{CacheEntry, EntryState, TranscodeCache, TranscodeKey};
use crate::capability::{Decision, OpenRequest, RequestingApp, RequiredAction};
use crate::codec::CodecService;
use crate::config::EngineConfig;
use crate::error::{Result, TranscodeError};
use crate::media::{MediaId, MediaStore};
use crate::policy::{AdminState, PolicyEngine};

/// Per-handle lifecycle. Passthrough handles go straight from `Opened` to
/// `Serving`; transcode handles pass through `Transcoding` while the build
/// their first read triggered is still producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opened,
    Transcoding,
    Serving,
    Closed,
}

enum Binding {
    /// Serve the original file's bytes
    Original,
    /// Serve the cached transcoded artifact
    Transcoded { entry: Arc<CacheEntry> },
}

/// A read handle returned by [`MediaVfs::open_for_read`].
///
/// The binding (original vs. transcoded) is fixed at open time; admin state
/// changes after the open never rebind it. The source path and modification
/// token are re-resolved from the store on every read, so a rename between
/// open and first read still builds from the current path, and a delete is
/// observed as `NotFound` rather than stale bytes.
pub struct ReadHandle {
    media: MediaId,
    /// Last path the identity resolved to, kept for error reporting
    last_path: PathBuf,
    binding: Binding,
    pos: u64,
    /// Modification token of the source the first read served from. A
    /// transcode handle must never splice bytes of two different builds,
    /// so a token change mid-stream fails the handle instead.
    source_token: Option<u64>,
    state: HandleState,
}

impl ReadHandle {
    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_transcoded(&self) -> bool {
        matches!(self.binding, Binding::Transcoded { .. })
    }

    pub fn media_id(&self) -> MediaId {
        self.media
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.state != HandleState::Closed {
            if let Binding::Transcoded { entry, .. } = &self.binding {
                entry.detach_reader();
            }
        }
    }
}

/// File-open interception layer: routes opens through the policy engine
/// and the transcode cache, and keeps both coherent with renames, deletes,
/// and content replacement.
pub struct MediaVfs {
    store: Arc<MediaStore>,
    policy: PolicyEngine,
    cache: TranscodeCache,
}

impl MediaVfs {
    pub fn new(
        config: &EngineConfig,
        store: Arc<MediaStore>,
        codec: Arc<dyn CodecService>,
        admin: AdminState,
    ) -> Result<Self> {
        let policy = PolicyEngine::new(config.eligible_roots.clone(), admin);
        let cache = TranscodeCache::new(
            &config.cache_dir,
            codec,
            Duration::from_secs(config.read_wait_secs),
        )?;
        Ok(Self {
            store,
            policy,
            cache,
        })
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    pub fn admin(&self) -> &AdminState {
        self.policy.admin()
    }

    /// Dry-run the policy decision for a path without opening a handle
    pub fn decide(&self, path: &Path, app: &RequestingApp, request: &OpenRequest) -> Result<Decision> {
        let media = self.lookup(path)?;
        Ok(self.policy.decide(app, &media, request))
    }

    /// Open a file for reading on behalf of an app. Never invokes the codec
    /// service: a transcode-bound handle defers that to its first read.
    pub fn open_for_read(
        &self,
        path: &Path,
        app: &RequestingApp,
        request: &OpenRequest,
    ) -> Result<ReadHandle> {
        let media = self.lookup(path)?;
        let decision = self.policy.decide(app, &media, request);
        info!(
            "open {} for uid {} ({}): {:?} [{}]",
            path.display(),
            app.uid,
            app.package,
            decision.action,
            decision.reasons.join("; ")
        );

        let binding = match decision.action {
            RequiredAction::Passthrough => Binding::Original,
            RequiredAction::Transcode(profile) => {
                let entry = self.cache.entry(TranscodeKey {
                    media: media.id,
                    profile,
                });
                entry.attach_reader();
                Binding::Transcoded { entry }
            }
        };

        Ok(ReadHandle {
            media: media.id,
            last_path: media.path,
            binding,
            pos: 0,
            source_token: None,
            state: HandleState::Opened,
        })
    }

    /// Read from a handle at its current position. For transcode-bound
    /// handles the first read starts (or joins) the build and may suspend
    /// while the producer is still ahead of the requested offset.
    pub async fn read(&self, handle: &mut ReadHandle, buf: &mut [u8]) -> Result<usize> {
        if handle.state == HandleState::Closed {
            return Err(TranscodeError::Closed);
        }
        // Re-resolve the identity: renames are picked up, deletes surface
        let media = self
            .store
            .get(handle.media)
            .ok_or_else(|| TranscodeError::NotFound(handle.last_path.clone()))?;
        handle.last_path = media.path.clone();

        match &handle.binding {
            Binding::Original => {
                let n = read_original(&media.path, handle.pos, buf).await?;
                handle.pos += n as u64;
                handle.state = HandleState::Serving;
                Ok(n)
            }
            Binding::Transcoded { entry, .. } => {
                match handle.source_token {
                    None => handle.source_token = Some(media.mod_token),
                    Some(token) if token != media.mod_token => {
                        // The content was replaced after this handle started
                        // consuming the previous build; resuming at the old
                        // offset into the rebuilt artifact would splice two
                        // different streams
                        debug!(
                            "handle for {} outlived its build (content replaced)",
                            media.path.display()
                        );
                        return Err(TranscodeError::Invalidated);
                    }
                    Some(_) => {}
                }
                if entry.state() != EntryState::Ready {
                    handle.state = HandleState::Transcoding;
                }
                self.cache.ensure_started(entry, &media.path, media.mod_token);
                let n = self
                    .cache
                    .read_at(entry, handle.pos, buf)
                    .await
                    .map_err(|err| match err {
                        TranscodeError::Invalidated => TranscodeError::NotFound(media.path.clone()),
                        other => other,
                    })?;
                handle.pos += n as u64;
                handle.state = HandleState::Serving;
                Ok(n)
            }
        }
    }

    /// Close a handle. Closing before a transcode completes never disturbs
    /// the shared build other readers may be waiting on.
    pub fn close(&self, handle: &mut ReadHandle) {
        if handle.state == HandleState::Closed {
            return;
        }
        if let Binding::Transcoded { entry, .. } = &handle.binding {
            entry.detach_reader();
        }
        handle.state = HandleState::Closed;
        debug!("closed handle for {}", handle.last_path.display());
    }

    /// Register a file with the engine, probing its codec
    pub fn stage(&self, path: &Path) -> Result<MediaId> {
        self.store.stage(path)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.store.exists(path)
    }

    pub fn len(&self, path: &Path) -> Option<u64> {
        self.store.len(path)
    }

    /// Rename a file. Identity is preserved, so cached artifacts keep
    /// serving the file under its new name without a re-transcode.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let id = self.store.rename(old, new)?;
        self.cache.on_rename(id);
        Ok(())
    }

    /// Delete a file. Visible immediately through every access path:
    /// the record is gone, cached artifacts are reclaimed, and handles
    /// still open against the identity observe `NotFound`.
    pub fn delete(&self, path: &Path) -> Result<()> {
        let id = self.store.remove(path)?;
        self.cache.on_delete(id);
        Ok(())
    }

    /// Replace a file's content in place, invalidating any cached
    /// artifacts built from the previous content.
    pub fn replace_contents(&self, path: &Path, content: &[u8]) -> Result<()> {
        let id = self.store.replace_contents(path, content)?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// Read a handle to completion. Convenience for consumers that want
    /// the whole view at once rather than streaming.
    pub async fn read_to_end(&self, handle: &mut ReadHandle) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(handle, &mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn lookup(&self, path: &Path) -> Result<crate::media::MediaFile> {
        let id = self
            .store
            .resolve(path)
            .ok_or_else(|| TranscodeError::NotFound(path.to_path_buf()))?;
        self.store
            .get(id)
            .ok_or_else(|| TranscodeError::NotFound(path.to_path_buf()))
    }
}

async fn read_original(path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|_| TranscodeError::NotFound(path.to_path_buf()))?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let n = file.read(buf).await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BuildSink;
    use crate::capability::{MediaCapabilities, TargetProfile};
    use crate::media::VideoCodec;
    use crate::policy::CompatOverride;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const UID: u32 = 10_077;
    const PKG: &str = "com.example.gallery";
    const HEVC_CONTENT: &[u8] = b"ftypisom....moov....hvc1 modern camera footage";

    /// Codec double: emits a deterministic AVC-tagged transform of the
    /// source bytes and counts invocations. An optional per-chunk delay
    /// keeps a build in flight long enough for tests to race against it.
    struct CountingCodec {
        calls: AtomicUsize,
        chunk_delay: Duration,
    }

    impl CountingCodec {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                chunk_delay: Duration::ZERO,
            }
        }

        fn slow(chunk_delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                chunk_delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodecService for CountingCodec {
        async fn transcode(
            &self,
            source: &Path,
            _profile: TargetProfile,
            sink: &mut BuildSink,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let original = tokio::fs::read(source).await?;
            sink.write_chunk(b"avc1 transcoded|").await?;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            sink.write_chunk(&original).await?;
            Ok(())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        vfs: MediaVfs,
        codec: Arc<CountingCodec>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_codec(CountingCodec::new())
        }

        fn with_codec(codec: CountingCodec) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let camera = tmp.path().join("DCIM/Camera");
            std::fs::create_dir_all(&camera).unwrap();
            let config = EngineConfig {
                eligible_roots: vec![camera],
                cache_dir: tmp.path().join("transcode-cache"),
                ffmpeg_bin: PathBuf::from("ffmpeg"),
                read_wait_secs: 5,
                chunk_bytes: 4096,
            };
            let codec = Arc::new(codec);
            let vfs = MediaVfs::new(
                &config,
                Arc::new(MediaStore::new()),
                codec.clone(),
                AdminState::new(),
            )
            .unwrap();
            Self { tmp, vfs, codec }
        }

        fn camera_dir(&self) -> PathBuf {
            self.tmp.path().join("DCIM/Camera")
        }

        fn artifact_count(&self) -> usize {
            match std::fs::read_dir(self.tmp.path().join("transcode-cache")) {
                Ok(dir) => dir.count(),
                Err(_) => 0,
            }
        }

        fn stage_hevc(&self, name: &str) -> PathBuf {
            let path = self.camera_dir().join(name);
            std::fs::write(&path, HEVC_CONTENT).unwrap();
            let id = self.vfs.stage(&path).unwrap();
            assert_eq!(self.vfs.store().get(id).unwrap().codec, VideoCodec::Hevc);
            path
        }

        fn stage_hevc_outside(&self, name: &str) -> PathBuf {
            let movies = self.tmp.path().join("Movies");
            std::fs::create_dir_all(&movies).unwrap();
            let path = movies.join(name);
            std::fs::write(&path, HEVC_CONTENT).unwrap();
            self.vfs.stage(&path).unwrap();
            path
        }

        fn enable_uid(&self) {
            self.vfs.admin().set_seamless_enabled(true);
            self.vfs.admin().enable_for_uid(UID);
        }

        async fn open_and_read(&self, path: &Path, app: &RequestingApp) -> Result<Vec<u8>> {
            let mut handle = self.vfs.open_for_read(path, app, &OpenRequest::default())?;
            let out = self.vfs.read_to_end(&mut handle).await;
            self.vfs.close(&mut handle);
            out
        }
    }

    fn app() -> RequestingApp {
        RequestingApp::new(UID, PKG)
    }

    fn transcoded(original: &[u8]) -> Vec<u8> {
        let mut expected = b"avc1 transcoded|".to_vec();
        expected.extend_from_slice(original);
        expected
    }

    #[tokio::test]
    async fn test_enabled_uid_reads_transcoded_bytes() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");

        // Before enablement the original is served
        let before = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(before, HEVC_CONTENT);

        fx.enable_uid();
        let after = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(after, transcoded(HEVC_CONTENT));
        assert_eq!(fx.codec.calls(), 1);
    }

    #[tokio::test]
    async fn test_outside_eligible_roots_always_original() {
        let fx = Fixture::new();
        let path = fx.stage_hevc_outside("downloaded.mp4");
        fx.enable_uid();

        let content = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(content, HEVC_CONTENT);
        assert_eq!(fx.codec.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_without_read_is_lazy() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        assert_eq!(handle.state(), HandleState::Opened);
        assert!(handle.is_transcoded());
        // No read yet: the codec must not have run and the artifact must
        // hold no bytes
        assert_eq!(fx.codec.calls(), 0);

        let mut buf = [0u8; 16];
        let n = fx.vfs.read(&mut handle, &mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(fx.codec.calls(), 1);
        fx.vfs.close(&mut handle);
    }

    #[tokio::test]
    async fn test_second_open_reuses_cached_artifact() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let first = fx.open_and_read(&path, &app()).await.unwrap();
        let second = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.codec.calls(), 1);
    }

    #[tokio::test]
    async fn test_rename_preserves_cache_reuse() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let before = fx.open_and_read(&path, &app()).await.unwrap();

        let renamed = fx.camera_dir().join("renamed_clip.mp4");
        fx.vfs.rename(&path, &renamed).unwrap();
        assert!(!fx.vfs.exists(&path));
        assert!(fx.vfs.exists(&renamed));

        let after = fx.open_and_read(&renamed, &app()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(fx.codec.calls(), 1);
    }

    #[tokio::test]
    async fn test_rename_between_open_and_read_uses_current_path() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        let renamed = fx.camera_dir().join("renamed_clip.mp4");
        fx.vfs.rename(&path, &renamed).unwrap();

        let out = fx.vfs.read_to_end(&mut handle).await.unwrap();
        assert_eq!(out, transcoded(HEVC_CONTENT));
        fx.vfs.close(&mut handle);
    }

    #[tokio::test]
    async fn test_delete_visible_through_every_path() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        fx.open_and_read(&path, &app()).await.unwrap();

        fx.vfs.delete(&path).unwrap();
        assert!(!fx.vfs.exists(&path));
        assert!(!path.exists());

        // Disabling transcoding afterwards must not resurrect the file
        fx.vfs.admin().disable_all_uids();
        fx.vfs.admin().set_seamless_enabled(false);
        assert!(!fx.vfs.exists(&path));
        assert!(matches!(
            fx.open_and_read(&path, &app()).await,
            Err(TranscodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_surfaces_to_open_handle() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        fx.vfs.delete(&path).unwrap();

        let mut buf = [0u8; 16];
        let err = fx.vfs.read(&mut handle, &mut buf).await.unwrap_err();
        assert!(matches!(err, TranscodeError::NotFound(_)));
        fx.vfs.close(&mut handle);
    }

    #[tokio::test]
    async fn test_force_original_override_beats_uid_enablement() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();
        fx.vfs
            .admin()
            .set_compat_override(PKG, CompatOverride::ForceOriginal);

        let content = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(content, HEVC_CONTENT);
        assert_eq!(fx.codec.calls(), 0);
    }

    #[tokio::test]
    async fn test_force_transcode_override_without_enablement() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        // Seamless transcoding never enabled for this uid
        fx.vfs
            .admin()
            .set_compat_override(PKG, CompatOverride::ForceTranscode);

        let content = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(content, transcoded(HEVC_CONTENT));
        assert_eq!(fx.codec.calls(), 1);
    }

    #[tokio::test]
    async fn test_accept_original_request_reads_original() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::accepting_original(true))
            .unwrap();
        let content = fx.vfs.read_to_end(&mut handle).await.unwrap();
        fx.vfs.close(&mut handle);
        assert_eq!(content, HEVC_CONTENT);
        assert_eq!(fx.codec.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_capability_descriptor_decides() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let hevc_capable =
            OpenRequest::with_capabilities(MediaCapabilities::none().with_video(VideoCodec::Hevc));
        let mut handle = fx.vfs.open_for_read(&path, &app(), &hevc_capable).unwrap();
        let content = fx.vfs.read_to_end(&mut handle).await.unwrap();
        fx.vfs.close(&mut handle);
        assert_eq!(content, HEVC_CONTENT);

        let legacy_only = OpenRequest::with_capabilities(MediaCapabilities::none());
        let mut handle = fx.vfs.open_for_read(&path, &app(), &legacy_only).unwrap();
        let content = fx.vfs.read_to_end(&mut handle).await.unwrap();
        fx.vfs.close(&mut handle);
        assert_eq!(content, transcoded(HEVC_CONTENT));
    }

    #[tokio::test]
    async fn test_manifest_hevc_app_reads_original() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.vfs.admin().set_seamless_enabled(true);
        fx.vfs.admin().enable_for_package(PKG);

        let hevc_app =
            app().with_manifest(MediaCapabilities::none().with_video(VideoCodec::Hevc));
        let content = fx.open_and_read(&path, &hevc_app).await.unwrap();
        assert_eq!(content, HEVC_CONTENT);
        assert_eq!(fx.codec.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_opens_converge_on_one_build() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let vfs = Arc::new(fx.vfs);
        let mut handles = Vec::new();
        for _ in 0..6 {
            let vfs = Arc::clone(&vfs);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let mut handle = vfs.open_for_read(&path, &app(), &OpenRequest::default())?;
                let out = vfs.read_to_end(&mut handle).await;
                vfs.close(&mut handle);
                out
            }));
        }
        for task in handles {
            assert_eq!(task.await.unwrap().unwrap(), transcoded(HEVC_CONTENT));
        }
        assert_eq!(fx.codec.calls(), 1);
    }

    #[tokio::test]
    async fn test_replaced_content_invalidates_cache() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(fx.codec.calls(), 1);

        let retake: &[u8] = b"ftyp....hvc1 retake of the same scene";
        fx.vfs.replace_contents(&path, retake).unwrap();

        let content = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(content, transcoded(retake));
        assert_eq!(fx.codec.calls(), 2);
    }

    #[tokio::test]
    async fn test_replaced_content_fails_partially_read_handle() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        let mut buf = [0u8; 16];
        let n = fx.vfs.read(&mut handle, &mut buf).await.unwrap();
        assert!(n > 0);

        let retake: &[u8] = b"ftyp....hvc1 retake of the same scene";
        fx.vfs.replace_contents(&path, retake).unwrap();

        // Continuing at the old offset would stitch bytes of the previous
        // build onto the rebuilt artifact; the handle fails instead
        let err = fx.vfs.read(&mut handle, &mut buf).await.unwrap_err();
        assert!(matches!(err, TranscodeError::Invalidated));
        fx.vfs.close(&mut handle);

        // A fresh open serves one consistent view of the new content
        let content = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(content, transcoded(retake));
    }

    #[tokio::test]
    async fn test_early_close_leaves_shared_build_intact() {
        let fx = Fixture::with_codec(CountingCodec::slow(Duration::from_millis(80)));
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut quitter = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        let mut stayer = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();

        // First read starts the build; the producer is still mid-stream
        // when the first handle walks away
        let mut buf = [0u8; 8];
        let n = fx.vfs.read(&mut quitter, &mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(quitter.state(), HandleState::Serving);
        fx.vfs.close(&mut quitter);

        let out = fx.vfs.read_to_end(&mut stayer).await.unwrap();
        fx.vfs.close(&mut stayer);
        assert_eq!(out, transcoded(HEVC_CONTENT));
        assert_eq!(fx.codec.calls(), 1);
        // The shared artifact survived the early close
        assert_eq!(fx.artifact_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_artifact_until_handle_closes() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");
        fx.enable_uid();

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        fx.vfs.read_to_end(&mut handle).await.unwrap();
        assert_eq!(fx.artifact_count(), 1);

        fx.vfs.delete(&path).unwrap();
        // The open handle still references the artifact; reclamation waits
        assert_eq!(fx.artifact_count(), 1);

        let mut buf = [0u8; 8];
        let err = fx.vfs.read(&mut handle, &mut buf).await.unwrap_err();
        assert!(matches!(err, TranscodeError::NotFound(_)));

        fx.vfs.close(&mut handle);
        assert_eq!(fx.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("PXL_20240101_120000.mp4");
        fx.enable_uid();

        // First open returns a handle without touching the codec
        let mut first = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        assert_eq!(fx.codec.calls(), 0);

        // First read transcodes to the AVC profile
        let first_bytes = fx.vfs.read_to_end(&mut first).await.unwrap();
        fx.vfs.close(&mut first);
        assert_eq!(first_bytes, transcoded(HEVC_CONTENT));
        assert_eq!(fx.codec.calls(), 1);

        // Second open by the same uid: byte-identical, no second invocation
        let second_bytes = fx.open_and_read(&path, &app()).await.unwrap();
        assert_eq!(second_bytes, first_bytes);
        assert_eq!(fx.codec.calls(), 1);

        // Delete removes both the original and the cached view
        fx.vfs.delete(&path).unwrap();
        assert!(!fx.vfs.exists(&path));
        assert!(matches!(
            fx.open_and_read(&path, &app()).await,
            Err(TranscodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let fx = Fixture::new();
        let path = fx.stage_hevc("clip.mp4");

        let mut handle = fx
            .vfs
            .open_for_read(&path, &app(), &OpenRequest::default())
            .unwrap();
        fx.vfs.close(&mut handle);
        assert_eq!(handle.state(), HandleState::Closed);

        let mut buf = [0u8; 8];
        let err = fx.vfs.read(&mut handle, &mut buf).await.unwrap_err();
        assert!(matches!(err, TranscodeError::Closed));
    }
}
