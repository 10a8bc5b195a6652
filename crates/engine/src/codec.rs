use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::cache::BuildSink;
use crate::capability::TargetProfile;
use crate::error::{Result, TranscodeError};

/// Opaque codec service the cache invokes to populate an artifact.
///
/// Implementations stream bytes into the sink as they are produced; readers
/// may consume them before the transcode completes. Returning an error
/// fails the build for every waiter and resets the cache entry so a later
/// open can retry.
#[async_trait]
pub trait CodecService: Send + Sync {
    async fn transcode(
        &self,
        source: &Path,
        profile: TargetProfile,
        sink: &mut BuildSink,
    ) -> Result<()>;
}

/// Codec service backed by an ffmpeg subprocess.
pub struct FfmpegCodec {
    bin: PathBuf,
    chunk_bytes: usize,
}

impl FfmpegCodec {
    pub fn new(bin: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self {
            bin: bin.into(),
            chunk_bytes: chunk_bytes.max(4096),
        }
    }

    fn encoder_args(profile: TargetProfile) -> &'static [&'static str] {
        match profile {
            TargetProfile::Avc => &["-c:v", "libx264", "-preset", "veryfast"],
        }
    }
}

#[async_trait]
impl CodecService for FfmpegCodec {
    async fn transcode(
        &self,
        source: &Path,
        profile: TargetProfile,
        sink: &mut BuildSink,
    ) -> Result<()> {
        // Fragmented MP4 so output is valid while still being written;
        // the artifact is consumed as a stream, not after completion
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-nostdin")
            .arg("-i")
            .arg(source)
            .arg("-map")
            .arg("0")
            .args(Self::encoder_args(profile))
            .arg("-c:a")
            .arg("copy")
            .arg("-movflags")
            .arg("frag_keyframe+empty_moov")
            .arg("-f")
            .arg("mp4")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("ffmpeg transcode: {} -> {}", source.display(), profile.tag());

        let mut child = cmd
            .spawn()
            .map_err(|e| TranscodeError::CodecFailure(format!("failed to spawn ffmpeg: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::CodecFailure("ffmpeg stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::CodecFailure("ffmpeg stderr unavailable".into()))?;

        // Drain stderr concurrently so a chatty encoder cannot stall stdout
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut chunk = vec![0u8; self.chunk_bytes];
        loop {
            let n = stdout.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            sink.write_chunk(&chunk[..n]).await?;
        }

        let status = child.wait().await?;
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let detail = String::from_utf8_lossy(&stderr_bytes);
            return Err(TranscodeError::CodecFailure(format!(
                "ffmpeg exited with {} for {}: {}",
                status,
                source.display(),
                detail.trim()
            )));
        }

        Ok(())
    }
}
