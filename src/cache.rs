//! Build caches shared between builds.
//!
//! Each cache is a host directory bind mounted read-write into the sandbox.
//! The table is the single source of truth; named helpers for individual
//! caches are deliberately absent.

use std::path::Path;

use crate::BUILD_USER_HOME;

/// A persistent per-tool cache shared across builds.
#[derive(Debug, Clone)]
pub struct BuildCache {
    /// Short name, also the host-side directory name under the cache root.
    pub name: &'static str,

    /// The chroot-internal cache directory.
    pub cache_dir: String,
}

/// All caches exposed to sandboxed builds.
pub fn caches() -> Vec<BuildCache> {
    vec![
        BuildCache {
            name: "ccache",
            cache_dir: format!("{BUILD_USER_HOME}/.ccache"),
        },
        BuildCache {
            name: "sccache",
            cache_dir: format!("{BUILD_USER_HOME}/.cache/sccache"),
        },
    ]
}

impl BuildCache {
    /// Host-side directory for this cache under the given cache root.
    pub fn host_dir(&self, cache_root: &Path) -> std::path::PathBuf {
        cache_root.join(self.name)
    }

    /// In-root directory for this cache under the given mount point.
    pub fn sandbox_dir(&self, mount_point: &Path) -> std::path::PathBuf {
        mount_point.join(self.cache_dir.trim_start_matches('/'))
    }
}
