use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the seamless transcode engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directories where transcoding policy applies (e.g. the camera
    /// capture folder); everything outside these roots is passthrough-only
    pub eligible_roots: Vec<PathBuf>,
    /// Directory where transcoded artifacts are stored
    pub cache_dir: PathBuf,
    /// Path to the ffmpeg binary used by the default codec service
    pub ffmpeg_bin: PathBuf,
    /// Maximum seconds a reader will wait for bytes the producer has not
    /// yet written before the read fails with a timeout
    pub read_wait_secs: u64,
    /// Chunk size in bytes for streaming codec output into the artifact
    pub chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            eligible_roots: vec![PathBuf::from("/storage/emulated/0/DCIM/Camera")],
            cache_dir: PathBuf::from("/tmp/seamlessd-cache"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            read_wait_secs: 30,
            chunk_bytes: 256 * 1024,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: EngineConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: EngineConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }

    /// Check whether a path falls under one of the transcode-eligible roots
    pub fn is_eligible(&self, path: &Path) -> bool {
        self.eligible_roots.iter().any(|root| path.starts_with(root))
    }
}
