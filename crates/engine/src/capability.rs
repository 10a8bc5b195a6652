use std::collections::HashSet;
use std::path::PathBuf;

use crate::media::{MediaFile, VideoCodec};

/// Declared set of video codecs an application can natively decode,
/// either from its manifest or attached to a single open request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCapabilities {
    supported_video: HashSet<VideoCodec>,
}

impl MediaCapabilities {
    /// An empty declaration: present, but supporting nothing modern
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, codec: VideoCodec) -> Self {
        self.supported_video.insert(codec);
        self
    }

    pub fn supports(&self, codec: VideoCodec) -> bool {
        self.supported_video.contains(&codec)
    }
}

/// The application on whose behalf a file is being opened
#[derive(Debug, Clone)]
pub struct RequestingApp {
    pub uid: u32,
    pub package: String,
    /// Manifest-declared capabilities; absence means the app declared
    /// nothing and is assumed unable to decode modern codecs
    pub manifest_capabilities: Option<MediaCapabilities>,
}

impl RequestingApp {
    pub fn new(uid: u32, package: &str) -> Self {
        Self {
            uid,
            package: package.to_string(),
            manifest_capabilities: None,
        }
    }

    pub fn with_manifest(mut self, caps: MediaCapabilities) -> Self {
        self.manifest_capabilities = Some(caps);
        self
    }
}

/// Per-request override bundle attached to a single open
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    /// Explicit "give me the original format" directive. `Some(false)` is
    /// treated like absence: it does not force a transcode on its own.
    pub accept_original: Option<bool>,
    /// Explicit capability descriptor for this request, overriding the
    /// app's manifest declaration when present
    pub capabilities: Option<MediaCapabilities>,
}

impl OpenRequest {
    pub fn accepting_original(accept: bool) -> Self {
        Self {
            accept_original: Some(accept),
            ..Self::default()
        }
    }

    pub fn with_capabilities(caps: MediaCapabilities) -> Self {
        Self {
            capabilities: Some(caps),
            ..Self::default()
        }
    }
}

/// Codec profile a transcode targets. The only conversion in scope is
/// HEVC to AVC, but the cache is keyed by profile so unrelated profiles
/// never share artifacts or build locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetProfile {
    Avc,
}

impl TargetProfile {
    pub fn tag(&self) -> &'static str {
        match self {
            TargetProfile::Avc => "avc",
        }
    }
}

/// Outcome of a policy or capability decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    /// Serve the original file untouched
    Passthrough,
    /// Serve a variant transcoded to the given profile
    Transcode(TargetProfile),
}

/// A decision plus the reasons that produced it, for logs and dry runs
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: RequiredAction,
    pub reasons: Vec<String>,
}

impl Decision {
    pub(crate) fn passthrough(reason: impl Into<String>) -> Self {
        Self {
            action: RequiredAction::Passthrough,
            reasons: vec![reason.into()],
        }
    }

    pub(crate) fn transcode(profile: TargetProfile, reason: impl Into<String>) -> Self {
        Self {
            action: RequiredAction::Transcode(profile),
            reasons: vec![reason.into()],
        }
    }

    pub fn is_transcode(&self) -> bool {
        matches!(self.action, RequiredAction::Transcode(_))
    }
}

/// Decide whether a requesting app can take a file's original codec.
///
/// Pure function over the supplied state; administrative overrides are the
/// policy engine's concern and are applied before this resolver runs.
/// Priority order:
/// 1. paths outside the eligible roots are always passthrough
/// 2. a source that is not HEVC has nothing to transcode
/// 3. an explicit accept-original directive wins
/// 4. a request-attached capability descriptor is evaluated as declared
/// 5. otherwise the manifest declaration decides; no declaration means
///    the modern codec is unsupported
pub fn resolve(
    app: &RequestingApp,
    media: &MediaFile,
    request: &OpenRequest,
    eligible_roots: &[PathBuf],
) -> Decision {
    if !eligible_roots.iter().any(|root| media.path.starts_with(root)) {
        return Decision::passthrough(format!(
            "{} is outside the transcode-eligible roots",
            media.path.display()
        ));
    }

    if media.codec != VideoCodec::Hevc {
        return Decision::passthrough(format!(
            "source codec {} needs no transcode",
            media.codec.mime()
        ));
    }

    if request.accept_original == Some(true) {
        return Decision::passthrough("request accepts the original format");
    }

    if let Some(caps) = &request.capabilities {
        return if caps.supports(VideoCodec::Hevc) {
            Decision::passthrough("request capabilities declare HEVC support")
        } else {
            Decision::transcode(
                TargetProfile::Avc,
                "request capabilities do not declare HEVC support",
            )
        };
    }

    match &app.manifest_capabilities {
        Some(caps) if caps.supports(VideoCodec::Hevc) => {
            Decision::passthrough(format!("{} declares HEVC support in its manifest", app.package))
        }
        Some(_) => Decision::transcode(
            TargetProfile::Avc,
            format!("{} manifest declares no HEVC support", app.package),
        ),
        None => Decision::transcode(
            TargetProfile::Avc,
            format!("{} declares no media capabilities", app.package),
        ),
    }
}
