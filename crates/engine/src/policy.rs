use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::capability::{self, Decision, OpenRequest, RequestingApp, TargetProfile};
use crate::media::{MediaFile, VideoCodec};

/// Per-package compatibility override. Takes precedence over the global
/// switch and the enablement sets: when one is present, it alone decides
/// whether transcoding applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatOverride {
    /// Treat the package as unable to decode HEVC: transcode even when the
    /// package was never enabled for seamless transcoding
    ForceTranscode,
    /// Treat the package as HEVC-capable: always serve the original
    ForceOriginal,
}

#[derive(Debug, Default)]
struct AdminFlags {
    seamless_enabled: bool,
    enabled_uids: HashSet<u32>,
    enabled_packages: HashSet<String>,
    compat: HashMap<String, CompatOverride>,
}

/// Process-wide administrative state for seamless transcoding.
///
/// Injected into the policy engine rather than read as ambient state, so
/// tests and the diagnostic CLI can construct their own. Changes take
/// effect on the next decision; already-open handles keep the binding they
/// were opened with.
#[derive(Debug, Clone, Default)]
pub struct AdminState {
    inner: Arc<RwLock<AdminFlags>>,
}

impl AdminState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_seamless_enabled(&self, enabled: bool) {
        self.write().seamless_enabled = enabled;
    }

    pub fn enable_for_uid(&self, uid: u32) {
        self.write().enabled_uids.insert(uid);
    }

    pub fn disable_all_uids(&self) {
        self.write().enabled_uids.clear();
    }

    pub fn enable_for_package(&self, package: &str) {
        self.write().enabled_packages.insert(package.to_string());
    }

    pub fn disable_all_packages(&self) {
        self.write().enabled_packages.clear();
    }

    pub fn set_compat_override(&self, package: &str, value: CompatOverride) {
        self.write().compat.insert(package.to_string(), value);
    }

    /// Return a package to ordinary capability-based inference
    pub fn reset_compat(&self, package: &str) {
        self.write().compat.remove(package);
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AdminFlags> {
        self.inner.write().expect("admin state lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AdminFlags> {
        self.inner.read().expect("admin state lock poisoned")
    }
}

/// Combines administrative state with capability resolution into the single
/// yes/no transcode decision for an open.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    admin: AdminState,
    eligible_roots: Vec<PathBuf>,
}

impl PolicyEngine {
    pub fn new(eligible_roots: Vec<PathBuf>, admin: AdminState) -> Self {
        Self {
            admin,
            eligible_roots,
        }
    }

    pub fn admin(&self) -> &AdminState {
        &self.admin
    }

    /// Decide whether an open must be served transcoded.
    ///
    /// Tie-break order: compatibility override, then the enablement
    /// allow-list under the global switch, then capability inference.
    /// Path eligibility and a non-HEVC source short-circuit everything:
    /// overrides control policy for transcode candidates, they cannot make
    /// an ineligible or already-legacy file a candidate.
    pub fn decide(&self, app: &RequestingApp, media: &MediaFile, request: &OpenRequest) -> Decision {
        if !self.eligible_roots.iter().any(|root| media.path.starts_with(root)) {
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

        let admin = self.read_flags(app);
        match admin.compat {
            Some(CompatOverride::ForceOriginal) => {
                return Decision::passthrough(format!(
                    "compat override forces original for {}",
                    app.package
                ));
            }
            Some(CompatOverride::ForceTranscode) => {
                return Decision::transcode(
                    TargetProfile::Avc,
                    format!("compat override forces transcode for {}", app.package),
                );
            }
            None => {}
        }

        if !admin.seamless_enabled {
            return Decision::passthrough("seamless transcoding is globally disabled");
        }
        if !admin.enabled {
            return Decision::passthrough(format!(
                "transcoding not enabled for uid {} or package {}",
                app.uid, app.package
            ));
        }

        let decision = capability::resolve(app, media, request, &self.eligible_roots);
        debug!(
            "capability resolution for {} on {}: {:?}",
            app.package,
            media.path.display(),
            decision.action
        );
        decision
    }

    fn read_flags(&self, app: &RequestingApp) -> AppFlags {
        let flags = self.admin.read();
        AppFlags {
            seamless_enabled: flags.seamless_enabled,
            enabled: flags.enabled_uids.contains(&app.uid)
                || flags.enabled_packages.contains(&app.package),
            compat: flags.compat.get(&app.package).copied(),
        }
    }
}

/// Snapshot of the admin flags relevant to one requesting app
struct AppFlags {
    seamless_enabled: bool,
    enabled: bool,
    compat: Option<CompatOverride>,
}
